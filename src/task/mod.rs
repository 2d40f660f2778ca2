pub mod pcb;
pub mod table;
pub mod tcb;
pub mod zombie;

pub use pcb::{Pcb, PcbRef, Pid};
pub use tcb::{SchedState, Tcb, TcbRef, Tid};
