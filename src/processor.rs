// Common machinery of the two 2200 micromachines: the trait the system
// driver runs them through, the shared status-line cell the I/O world talks
// back over, and the BCD byte helpers both interpreters lean on.

use crate::fields::{CpuStatus, Exec};
use std::cell::RefCell;
use std::rc::Rc;
use thiserror::Error;

// both machines run a 100 ns clock
pub const NS_PER_TICK: u32 = 100;

#[derive(Debug, Error)]
pub enum UcodeError {
    #[error("microcode image exceeds the store ({words} words from 0x{base:04X}, store is {store})")]
    TooBig { base: u16, words: usize, store: usize },
    #[error("microcode image length {0} is not a whole number of words")]
    RaggedImage(usize),
}

// The CPU and the card world reference each other; rather than owning
// pointers both ways, cards get a handle to this little cell of wires.
// Levels and strobes land here and the CPU applies them at the top of the
// next microinstruction, which is below anything the microcode can observe.
pub struct CpuLines {
    dev_rdy: bool,             // level driven by the selected card
    ibs: Option<(u8, bool)>,   // strobed data byte + 9th (KFN) bit
    halt_strobe: bool,         // keyboard halt/step key
    oneshot_expired: bool,     // the 30 ms one-shot timer ran down
}

pub type CpuLinesPtr = Rc<RefCell<CpuLines>>;

impl CpuLines {
    pub fn new() -> CpuLinesPtr {
        Rc::new(RefCell::new(CpuLines {
            dev_rdy: false,
            ibs: None,
            halt_strobe: false,
            oneshot_expired: false,
        }))
    }

    // record the selected device's ready bit; nobody driving means low
    pub fn set_dev_rdy(&mut self, ready: bool) {
        self.dev_rdy = ready;
    }

    // IBS strobe: the selected device returns a byte into K and clears
    // CPU-busy; kfn is the 9th bit keyboards use for special functions
    pub fn ibs(&mut self, byte: u8, kfn: bool) {
        self.ibs = Some((byte, kfn));
    }

    pub fn halt(&mut self) {
        self.halt_strobe = true;
    }

    pub fn expire_oneshot(&mut self) {
        self.oneshot_expired = true;
    }

    pub fn clear_oneshot_pending(&mut self) {
        self.oneshot_expired = false;
    }

    pub fn dev_rdy(&self) -> bool {
        self.dev_rdy
    }

    // drain the event side; the level side is read separately
    pub fn take_events(&mut self) -> (Option<(u8, bool)>, bool, bool) {
        let ibs = self.ibs.take();
        let halt = self.halt_strobe;
        let oneshot = self.oneshot_expired;
        self.halt_strobe = false;
        self.oneshot_expired = false;
        (ibs, halt, oneshot)
    }
}

// the interface the system driver and the configuration layer run a
// micromachine through, whichever variant is installed
pub trait Cpu2200 {
    // hard=true is a power-on reset (memory wiped); soft keeps memory but
    // clears the run state
    fn reset(&mut self, hard: bool);

    // execute exactly one microinstruction.  the driver feeds the elapsed
    // time to the scheduler.
    fn exec_one_op(&mut self) -> Exec;

    fn status(&self) -> CpuStatus;

    // shared status lines handed to each card at construction
    fn lines(&self) -> CpuLinesPtr;

    // store one word (with predecode) into the microcode store
    fn write_ucode(&mut self, addr: u16, uop: u32);

    // load a binary microcode image (4-byte little-endian records, one
    // word per record) starting at the given control address
    fn load_ucode(&mut self, base: u16, image: &[u8]) -> Result<(), UcodeError>;
}

// split a binary image into words: 4-byte little-endian records
pub fn image_words(image: &[u8]) -> Result<Vec<u32>, UcodeError> {
    if image.len() % 4 != 0 {
        return Err(UcodeError::RaggedImage(image.len()));
    }
    Ok(image
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

// ------------------------------------------------------------------------
// BCD helpers
// ------------------------------------------------------------------------
// 9b result: carry out in bit 8 and the 8b sum below it.  out of range
// digits (>9) are tolerated; diagnostic code depends on the raw arithmetic.

pub fn decimal_add8(a_op: u32, b_op: u32, ci: u32) -> u32 {
    let a_low = a_op & 0xF;
    let b_low = b_op & 0xF;
    let a_high = (a_op >> 4) & 0xF;
    let b_high = (b_op >> 4) & 0xF;

    let mut sum_low = a_low + b_low + ci; // ranges from binary 0 to 19
    let mut co = (sum_low > 9) as u32;
    if co != 0 {
        sum_low -= 10;
    }

    let mut sum_high = a_high + b_high + co;
    co = (sum_high > 9) as u32;
    if co != 0 {
        sum_high -= 10;
    }

    (co << 8) + (sum_high << 4) + sum_low
}

// 9b result: borrow out in bit 8 (1 = borrow) and the 8b difference.
// ci=0 computes a-b; ci=1 computes a-b-1.
// signed arithmetic so that out of range digits fall where they may.
pub fn decimal_sub8(a_op: u32, b_op: u32, ci: u32) -> u32 {
    let a_low = (a_op & 0xF) as i32;
    let a_high = ((a_op >> 4) & 0xF) as i32;
    // 9's complement of b; the +1 of the 10's complement is folded into
    // the !ci carry-in below
    let b_low = 9 - ((b_op & 0xF) as i32);
    let b_high = 9 - (((b_op >> 4) & 0xF) as i32);

    let mut sum_low = a_low + b_low + (ci == 0) as i32;
    let mut borrow;
    if sum_low > 9 {
        sum_low -= 10;
        borrow = 0;
    } else {
        borrow = 1;
    }

    let mut sum_high = a_high + b_high + (borrow == 0) as i32;
    if sum_high > 9 {
        sum_high -= 10;
        borrow = 0;
    } else {
        borrow = 1;
    }

    (((borrow << 8) + (sum_high << 4) + sum_low) as u16) as u32
}
