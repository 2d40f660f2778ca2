/*
 * Console Service
 *
 * The manager CPU owns the VGA text console: cursor, color, output and
 * line input all live here and are reached only through bus messages, so
 * no locking is ever needed against worker CPUs, only against the
 * manager's own keyboard interrupt.
 *
 * READLINE requests that cannot be satisfied yet are parked; the
 * keyboard interrupt completes them when a full line is in.
 */

pub mod keyboard;

use alloc::collections::VecDeque;

use volatile::Volatile;

use crate::bus::{self, Message, MsgKind, MsgPayload};
use crate::sync::SpinLock;

const VGA_BUFFER: u32 = 0xb8000;
pub const ROWS: usize = 25;
pub const COLS: usize = 80;

const DEFAULT_COLOR: u8 = 0x07; // light grey on black

#[repr(transparent)]
#[derive(Clone, Copy)]
struct ScreenChar(u16);

impl ScreenChar {
    fn new(byte: u8, color: u8) -> Self {
        Self((color as u16) << 8 | byte as u16)
    }
}

type VgaBuffer = [[Volatile<ScreenChar>; COLS]; ROWS];

struct Console {
    row: usize,
    col: usize,
    color: u8,
    /// Completed input lines waiting for readline requests.
    lines: VecDeque<alloc::vec::Vec<u8>>,
    /// Line being typed. Bounded; input past the cap is dropped until a
    /// newline lands.
    partial: heapless::Vec<u8, 256>,
    /// Parked READLINE messages, FIFO.
    pending_reads: VecDeque<*mut Message>,
}

// SAFETY: manager CPU only; the spinlock orders the dispatch loop
// against the keyboard interrupt.
unsafe impl Send for Console {}

static CONSOLE: SpinLock<Console> = SpinLock::new(Console {
    row: 0,
    col: 0,
    color: DEFAULT_COLOR,
    lines: VecDeque::new(),
    partial: heapless::Vec::new(),
    pending_reads: VecDeque::new(),
});

fn vga() -> &'static mut VgaBuffer {
    // SAFETY: the VGA text buffer is inside the kernel direct map and
    // only the manager CPU writes it.
    unsafe { &mut *(VGA_BUFFER as *mut VgaBuffer) }
}

impl Console {
    fn put_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => {
                self.col = 0;
                self.advance_row();
            }
            b'\r' => self.col = 0,
            0x08 => {
                // backspace: retreat and blank
                if self.col > 0 {
                    self.col -= 1;
                    vga()[self.row][self.col].write(ScreenChar::new(b' ', self.color));
                }
            }
            byte => {
                vga()[self.row][self.col].write(ScreenChar::new(byte, self.color));
                self.col += 1;
                if self.col == COLS {
                    self.col = 0;
                    self.advance_row();
                }
            }
        }
    }

    fn advance_row(&mut self) {
        if self.row + 1 < ROWS {
            self.row += 1;
            return;
        }
        // Scroll up one line.
        for row in 1..ROWS {
            for col in 0..COLS {
                let c = vga()[row][col].read();
                vga()[row - 1][col].write(c);
            }
        }
        for col in 0..COLS {
            vga()[ROWS - 1][col].write(ScreenChar::new(b' ', self.color));
        }
    }

    fn sync_hw_cursor(&self) {
        let pos = (self.row * COLS + self.col) as u16;
        unsafe {
            x86::io::outb(0x3d4, 0x0f);
            x86::io::outb(0x3d5, (pos & 0xff) as u8);
            x86::io::outb(0x3d4, 0x0e);
            x86::io::outb(0x3d5, (pos >> 8) as u8);
        }
    }
}

/// Clear the screen and home the cursor.
pub fn init() {
    let mut con = CONSOLE.lock();
    for row in 0..ROWS {
        for col in 0..COLS {
            vga()[row][col].write(ScreenChar::new(b' ', DEFAULT_COLOR));
        }
    }
    con.row = 0;
    con.col = 0;
    con.sync_hw_cursor();
    log::info!("console cleared, {}x{}", COLS, ROWS);
}

/// PRINT service: write a staged buffer to the screen.
pub fn write_bytes(buf: &[u8]) {
    let mut con = CONSOLE.lock();
    for &b in buf {
        con.put_byte(b);
    }
    con.sync_hw_cursor();
}

/// SET_CURSOR_POS service.
pub fn set_cursor(row: i32, col: i32) -> i32 {
    if row < 0 || row as usize >= ROWS || col < 0 || col as usize >= COLS {
        return crate::syscall::numbers::EINVAL;
    }
    let mut con = CONSOLE.lock();
    con.row = row as usize;
    con.col = col as usize;
    con.sync_hw_cursor();
    0
}

/// GET_CURSOR_POS service.
pub fn cursor() -> (i32, i32) {
    let con = CONSOLE.lock();
    (con.row as i32, con.col as i32)
}

/// SET_TERM_COLOR service.
pub fn set_color(color: u32) -> i32 {
    if color > 0xff {
        return crate::syscall::numbers::EINVAL;
    }
    CONSOLE.lock().color = color as u8;
    0
}

/// READLINE service entry from the manager dispatch loop.
///
/// Replies immediately when a complete line is buffered, otherwise parks
/// the message for the keyboard interrupt to complete.
pub fn readline_request(msg: *mut Message) {
    let mut con = CONSOLE.lock();
    if let Some(line) = con.lines.pop_front() {
        drop(con);
        complete_readline(msg, &line);
    } else {
        con.pending_reads.push_back(msg);
    }
}

/// Copy a finished line into the request's staging buffer and send the
/// reply back through the bus.
fn complete_readline(msg: *mut Message, line: &[u8]) {
    let m = unsafe { &mut *msg };
    let MsgPayload::Readline { buf, len } = m.payload else {
        panic!("readline completion on non-readline message");
    };
    let n = line.len().min(len as usize);
    unsafe {
        core::ptr::copy_nonoverlapping(line.as_ptr(), buf, n);
    }
    m.kind = MsgKind::Response;
    m.payload = MsgPayload::Result { value: n as i32 };
    let cpu = m.cpu as usize;
    bus::manager_send(msg, cpu);
}

/// Keyboard input: one decoded character. Runs in the manager's keyboard
/// interrupt.
pub fn input_char(c: u8) {
    let mut con = CONSOLE.lock();
    // Echo, including the newline.
    con.put_byte(c);
    con.sync_hw_cursor();

    match c {
        0x08 => {
            con.partial.pop();
        }
        b'\n' => {
            let mut line: alloc::vec::Vec<u8> = con.partial.iter().copied().collect();
            con.partial.clear();
            line.push(b'\n');
            if let Some(msg) = con.pending_reads.pop_front() {
                drop(con);
                complete_readline(msg, &line);
            } else {
                con.lines.push_back(line);
            }
        }
        c => {
            let _ = con.partial.push(c);
        }
    }
}
