/*
 * Keyboard Input
 *
 * Scan-code decoding via the pc-keyboard crate; decoded characters feed
 * the console's line buffer. Runs entirely in the manager CPU's keyboard
 * interrupt.
 */

use lazy_static::lazy_static;
use pc_keyboard::{layouts, DecodedKey, HandleControl, Keyboard, ScancodeSet1};
use spin::Mutex;

lazy_static! {
    static ref KEYBOARD: Mutex<Keyboard<layouts::Us104Key, ScancodeSet1>> = Mutex::new(
        Keyboard::new(
            ScancodeSet1::new(),
            layouts::Us104Key,
            HandleControl::MapLettersToUnicode
        )
    );
}

/// Feed one raw scan code from the interrupt handler.
pub fn on_scancode(scancode: u8) {
    let mut kbd = KEYBOARD.lock();
    let Ok(Some(event)) = kbd.add_byte(scancode) else {
        return;
    };
    let Some(key) = kbd.process_keyevent(event) else {
        return;
    };
    match key {
        DecodedKey::Unicode(c) if c.is_ascii() => {
            let byte = c as u8;
            // Map carriage return to newline, delete to backspace.
            let byte = match byte {
                b'\r' => b'\n',
                0x7f => 0x08,
                b => b,
            };
            super::input_char(byte);
        }
        _ => {}
    }
}
