// The first-generation T nibble micromachine (2200B and 2200T): a 20-bit
// horizontal microword, eight 4-bit file registers, a 16-deep subroutine
// stack, four 4-bit status registers and data RAM addressed as nibbles
// packed two per byte.  The 2200B differs from the T only in the microcode
// image it runs.
//
// The word layout itself is the reconstruction documented in parser.rs.

use crate::bus::{self, IoBusPtr};
use crate::fields::{fetch, st1, st3, CpuStatus, Exec, MicroWord, Op};
use crate::parser;
use crate::processor::{image_words, Cpu2200, CpuLines, CpuLinesPtr, UcodeError, NS_PER_TICK};
use crate::scheduler::SchedulerPtr;
use log::{debug, error};
use std::rc::Rc;

const STACKSIZE: usize = 16;
const MAX_UCODE: usize = 32 * 1024;
const NUM_AUX: usize = 16;
const KROM_SIZE: usize = 2048;

pub struct Cpu2200T {
    pub pc: u16, // working nibble address
    pub aux: [u16; NUM_AUX],
    pub reg: [u8; 8], // 4-bit file registers
    pub ic: u16,
    pub icstack: [u16; STACKSIZE],
    pub icsp: usize,
    pub st1: u8,
    pub st2: u8,
    pub st3: u8, // the stored value; reads are special-cased
    pub st4: u8,
    pub c: u8, // memory read register (one packed byte)
    pub k: u8, // I/O data register
    pub ab: u8,
    pub ab_sel: u8,

    ram: Vec<u8>, // two nibbles per byte
    krom: Vec<u8>,
    ucode: Vec<MicroWord>,
    status: CpuStatus,
    dev_rdy: bool,
    halted_key: bool,

    lines: CpuLinesPtr,
    bus: IoBusPtr,
    #[allow(dead_code)]
    scheduler: SchedulerPtr,
}

impl Cpu2200T {
    pub fn new(scheduler: SchedulerPtr, io_bus: IoBusPtr, memsize_kb: usize) -> Cpu2200T {
        let mut cpu = Cpu2200T {
            pc: 0,
            aux: [0; NUM_AUX],
            reg: [0; 8],
            ic: 0,
            icstack: [0; STACKSIZE],
            icsp: 0,
            st1: 0,
            st2: 0,
            st3: 0,
            st4: 0,
            c: 0,
            k: 0,
            ab: 0,
            ab_sel: 0,
            ram: vec![0; memsize_kb * 1024],
            krom: vec![0; KROM_SIZE],
            ucode: vec![MicroWord::default(); MAX_UCODE],
            status: CpuStatus::Running,
            dev_rdy: false,
            halted_key: false,
            lines: CpuLines::new(),
            bus: io_bus,
            scheduler,
        };
        cpu.reset(true);
        cpu
    }

    // the constant rom is loaded once at build time and is read-only
    pub fn load_krom(&mut self, image: &[u8]) {
        let n = image.len().min(KROM_SIZE);
        self.krom[..n].copy_from_slice(&image[..n]);
    }

    // nibble-packed RAM: even addresses are the low nibble of the byte
    pub fn ram_nib_read(&self, addr: u16) -> u8 {
        let idx = (addr >> 1) as usize;
        if idx >= self.ram.len() {
            return 0;
        }
        if addr & 1 != 0 {
            self.ram[idx] >> 4
        } else {
            self.ram[idx] & 0xF
        }
    }

    pub fn ram_nib_write(&mut self, addr: u16, nib: u8) {
        let idx = (addr >> 1) as usize;
        if idx >= self.ram.len() {
            return;
        }
        if addr & 1 != 0 {
            self.ram[idx] = (self.ram[idx] & 0x0F) | (nib << 4);
        } else {
            self.ram[idx] = (self.ram[idx] & 0xF0) | (nib & 0xF);
        }
    }

    fn carry_bit(&self) -> u32 {
        (self.st1 & st1::CARRY != 0) as u32
    }

    // carry in accordance with bit 4 of a nibble result
    fn set_carry(&mut self, v: u32) {
        self.st1 = (self.st1 & !st1::CARRY) | if v & 0x10 != 0 { st1::CARRY } else { 0 };
    }

    // ST1.1 is the CPU-busy wire; writing it notifies the bus
    fn set_st1(&mut self, value: u8) {
        let cpb_changed = (self.st1 ^ value) & st1::CPB != 0;
        self.st1 = value & 0xF;
        if cpb_changed {
            bus::cpu_cpb(&self.bus, self.st1 & st1::CPB != 0);
        }
    }

    // ST3 reads back hardware state, not what was last written
    fn read_st3(&self) -> u8 {
        (self.dev_rdy as u8 * st3::DEVRDY) | (self.halted_key as u8 * st3::HALT) | (self.st3 & 0xC)
    }

    fn inc_icsp(&mut self) {
        self.icsp = (self.icsp + 1) & (STACKSIZE - 1);
    }

    fn dec_icsp(&mut self) {
        self.icsp = (self.icsp + STACKSIZE - 1) & (STACKSIZE - 1);
    }

    fn fetch_nib(&self, spec: u32) -> u32 {
        u32::from(match spec {
            b @ 0..=7 => self.reg[b as usize] & 0xF,
            8 => self.c & 0xF,
            9 => self.c >> 4,
            10 => self.k & 0xF,
            11 => self.k >> 4,
            12 => self.st1,
            13 => self.st2,
            14 => self.read_st3(),
            _ => self.st4,
        })
    }

    // register-pair sources for the X forms; past R7 the specials alias in
    fn fetch_pair(&self, spec: u32) -> (u32, u32) {
        match spec {
            b @ 0..=6 => {
                (u32::from(self.reg[b as usize] & 0xF), u32::from(self.reg[b as usize + 1] & 0xF))
            }
            7 => (u32::from(self.reg[7] & 0xF), u32::from(self.c & 0xF)),
            8 => (u32::from(self.c & 0xF), u32::from(self.c >> 4)),
            9 => (u32::from(self.c >> 4), u32::from(self.k & 0xF)),
            10 => (u32::from(self.k & 0xF), u32::from(self.k >> 4)),
            11 => (u32::from(self.k >> 4), u32::from(self.st1)),
            12 => (u32::from(self.st1), u32::from(self.st2)),
            13 => (u32::from(self.st2), u32::from(self.read_st3())),
            14 => (u32::from(self.read_st3()), u32::from(self.st4)),
            _ => (u32::from(self.st4), u32::from(self.reg[0] & 0xF)),
        }
    }

    fn store_c(&mut self, c_field: u32, val: u32) {
        let v = (val & 0xF) as u8;
        match c_field {
            0..=7 => self.reg[c_field as usize] = v,
            8 => self.k = (self.k & 0xF0) | v,
            9 => self.k = (self.k & 0x0F) | (v << 4),
            10 => self.set_st1(v),
            11 => self.st2 = v,
            12 => self.st3 = v,
            13 => self.st4 = v,
            14 => self.ram_nib_write(self.pc, v),
            _ => {} // discard
        }
    }

    fn apply_lines(&mut self) {
        let (ibs, halt, _oneshot) = self.lines.borrow_mut().take_events();
        self.dev_rdy = self.lines.borrow().dev_rdy();
        if let Some((byte, kfn)) = ibs {
            self.k = byte;
            let mut v = self.st1 | st1::CPB;
            v = (v & !st1::KFN) | if kfn { st1::KFN } else { 0 };
            self.st1 = v;
            // the CPB wire went back high; the selected card tracks it
            bus::cpu_cpb(&self.bus, true);
        }
        if halt {
            self.halted_key = true;
        }
    }

    fn cio(&mut self, uop: u32) {
        let s_field = (uop >> 9) & 1;
        let t_field = (uop >> 2) & 0x7F;
        if s_field != 0 {
            self.ab = self.k;
        }
        match t_field {
            0x40 => {
                self.ab_sel = self.ab;
                debug!("-ABS with AB={:02X}, ic=0x{:04X}", self.ab_sel, self.ic);
                bus::cpu_abs(&self.bus, self.ab_sel);
            }
            0x10 => bus::cpu_cbs(&self.bus, self.k),
            0x20 => bus::cpu_obs(&self.bus, self.k),
            0x08 => {
                let ib5 = bus::cpu_poll_ib5(&self.bus);
                self.k = (ib5 as u8) << 4;
            }
            _ => {}
        }
    }

    // decimal nibble helpers, sharing the byte helpers' conventions but a
    // digit at a time; out of range digits are tolerated unmasked
    fn dec_add4(a: u32, b: u32, ci: u32) -> u32 {
        let mut sum = a + b + ci;
        let co = (sum > 9) as u32;
        if co != 0 {
            sum -= 10;
        }
        (co << 4) + sum
    }

    fn dec_sub4(a: u32, b: u32, ci: u32) -> u32 {
        let sum = a as i32 + (9 - b as i32) + (ci == 0) as i32;
        let (digit, borrow) = if sum > 9 { (sum - 10, 0) } else { (sum, 1) };
        (((borrow << 4) + digit) as u8) as u32
    }

    fn alu(&mut self, op: Op, a: u32, b: u32, carry_in: u32, chain: bool) -> u32 {
        match op {
            Op::Or | Op::OrX => a | b,
            Op::Xor | Op::XorX => a ^ b,
            Op::And | Op::AndX => a & b,
            Op::Sc | Op::ScX => {
                let r = a + (0xF ^ b) + carry_in;
                if !chain {
                    self.set_carry(r);
                }
                r
            }
            Op::Ac | Op::AcX => {
                let r = a + b + carry_in;
                if !chain {
                    self.set_carry(r);
                }
                r
            }
            Op::Dac | Op::DacX => {
                let r = Self::dec_add4(a, b, carry_in);
                if !chain {
                    self.set_carry(r);
                }
                r
            }
            Op::Dsc | Op::DscX => {
                // carry=1 is "no borrow pending"; the helper wants the
                // borrow itself, so flip on the way in and out.  chained
                // halves pass the raw borrow straight through.
                if chain {
                    Self::dec_sub4(a, b, carry_in)
                } else {
                    let r = Self::dec_sub4(a, b, 1 - carry_in) ^ 0x10;
                    self.set_carry(r);
                    r
                }
            }
            Op::M | Op::MX => (a * b) & 0xFF,
            Op::Sh | Op::ShX => (b << 4) | a,
            _ => unreachable!(),
        }
    }
}

impl Cpu2200 for Cpu2200T {
    fn reset(&mut self, hard: bool) {
        self.pc = 0;
        self.ic = 0;
        self.icsp = 0;
        self.st1 = 0;
        self.st2 = 0;
        self.st3 = 0;
        self.st4 = 0;
        self.c = 0;
        self.k = 0;
        self.ab = 0;
        self.ab_sel = 0;
        self.halted_key = false;
        self.status = CpuStatus::Running;
        if hard {
            for b in self.ram.iter_mut() {
                *b = 0;
            }
            self.reg = [0; 8];
            self.aux = [0; NUM_AUX];
            self.icstack = [0; STACKSIZE];
        }
    }

    fn status(&self) -> CpuStatus {
        self.status
    }

    fn lines(&self) -> CpuLinesPtr {
        Rc::clone(&self.lines)
    }

    fn write_ucode(&mut self, addr: u16, uop: u32) {
        let addr = addr & (MAX_UCODE as u16 - 1);
        self.ucode[addr as usize] = parser::predecode_t(addr, uop);
    }

    fn load_ucode(&mut self, base: u16, image: &[u8]) -> Result<(), UcodeError> {
        let words = image_words(image)?;
        if base as usize + words.len() > MAX_UCODE {
            return Err(UcodeError::TooBig { base, words: words.len(), store: MAX_UCODE });
        }
        for (i, w) in words.into_iter().enumerate() {
            self.write_ucode(base + i as u16, w);
        }
        Ok(())
    }

    fn exec_one_op(&mut self) -> Exec {
        if self.status == CpuStatus::Halted {
            return Exec::Halted;
        }

        self.apply_lines();

        let puop = self.ucode[(self.ic as usize) & (MAX_UCODE - 1)];
        let uop = puop.uop;
        let mut ticks: u32 = 6;

        let mut a_op: u32 = 0;
        let mut b_op: u32 = 0;
        let mut a_op2: u32 = 0;
        let mut b_op2: u32 = 0;

        if puop.flags & fetch::B != 0 {
            b_op = self.fetch_nib(uop & 0xF);
            if puop.flags & fetch::A != 0 {
                a_op = self.fetch_nib((uop >> 4) & 0xF);
            }
        } else if puop.flags & fetch::X != 0 {
            let (b0, b1) = self.fetch_pair(uop & 0xF);
            let (a0, a1) = self.fetch_pair((uop >> 4) & 0xF);
            b_op = b0;
            b_op2 = b1;
            a_op = a0;
            a_op2 = a1;
        }

        match puop.op {
            Op::Pecm => {
                // the T has no trap microstore; a parity hit is fatal
                error!("control memory parity error at ic={:04X}", self.ic);
                self.status = CpuStatus::Halted;
                return Exec::Illegal { ic: self.ic, uop };
            }

            Op::Illegal => {
                error!("{}\nillegal op at ic={:04X}", parser::dasm_one_t(self.ic, &puop), self.ic);
                self.status = CpuStatus::Halted;
                return Exec::Illegal { ic: self.ic, uop };
            }

            // single nibble ALU ops
            Op::Or | Op::Xor | Op::And | Op::Sc | Op::Ac | Op::Dac | Op::Dsc | Op::M | Op::Sh => {
                let cy = self.carry_bit();
                let rslt = self.alu(puop.op, a_op, b_op, cy, false);
                self.store_c((uop >> 8) & 0xF, rslt);
                self.ic = self.ic.wrapping_add(1);
            }

            // pair forms: the carry chains across the two nibbles
            Op::OrX
            | Op::XorX
            | Op::AndX
            | Op::ScX
            | Op::AcX
            | Op::DacX
            | Op::DscX
            | Op::MX
            | Op::ShX => {
                let cy = self.carry_bit();
                let first_ci = if puop.op == Op::DscX { 1 - cy } else { cy };
                let rslt = self.alu(puop.op, a_op, b_op, first_ci, true);
                let rslt2 = self.alu(puop.op, a_op2, b_op2, (rslt >> 4) & 1, true);
                let cy_out = if puop.op == Op::DscX { rslt2 ^ 0x10 } else { rslt2 };
                match puop.op {
                    Op::OrX | Op::XorX | Op::AndX | Op::MX | Op::ShX => {}
                    _ => self.set_carry(cy_out),
                }
                let c_field = (uop >> 8) & 0xF;
                self.store_c(c_field, rslt);
                self.store_c((c_field + 1) & 0xF, rslt2);
                self.ic = self.ic.wrapping_add(1);
            }

            // immediate forms; the immediate nibble rides in the A slot
            Op::Ori | Op::Xori | Op::Andi | Op::Ai | Op::Daci | Op::Dsci | Op::Aci | Op::Mi => {
                let imm = (uop >> 4) & 0xF;
                let cy = self.carry_bit();
                let rslt = match puop.op {
                    Op::Ori => imm | b_op,
                    Op::Xori => imm ^ b_op,
                    Op::Andi => imm & b_op,
                    Op::Ai => imm + b_op, // no carry update, like the VP
                    Op::Daci => {
                        let r = Self::dec_add4(imm, b_op, cy);
                        self.set_carry(r);
                        r
                    }
                    Op::Dsci => {
                        let r = Self::dec_sub4(imm, b_op, 1 - cy) ^ 0x10;
                        self.set_carry(r);
                        r
                    }
                    Op::Aci => {
                        let r = imm + b_op + cy;
                        self.set_carry(r);
                        r
                    }
                    _ => (imm * b_op) & 0xFF, // MI
                };
                self.store_c((uop >> 8) & 0xF, rslt);
                self.ic = self.ic.wrapping_add(1);
            }

            Op::Bt => {
                let imm = (uop >> 4) & 0xF;
                self.ic = if b_op & imm == imm { puop.p16 } else { self.ic.wrapping_add(1) };
            }
            Op::Bf => {
                let imm = (uop >> 4) & 0xF;
                self.ic = if b_op & imm == 0 { puop.p16 } else { self.ic.wrapping_add(1) };
            }
            Op::Beq => {
                let imm = (uop >> 4) & 0xF;
                self.ic = if b_op == imm { puop.p16 } else { self.ic.wrapping_add(1) };
            }
            Op::Bne => {
                let imm = (uop >> 4) & 0xF;
                self.ic = if b_op != imm { puop.p16 } else { self.ic.wrapping_add(1) };
            }

            Op::BlrX | Op::BlerX => unreachable!("pair branches exist only on the byte machine"),

            Op::Blr => {
                self.ic = if a_op < b_op { puop.p16 } else { self.ic.wrapping_add(1) };
            }
            Op::Bler => {
                self.ic = if a_op <= b_op { puop.p16 } else { self.ic.wrapping_add(1) };
            }
            Op::Ber => {
                self.ic = if a_op == b_op { puop.p16 } else { self.ic.wrapping_add(1) };
            }
            Op::Bnr => {
                self.ic = if a_op != b_op { puop.p16 } else { self.ic.wrapping_add(1) };
            }

            Op::Sb => {
                self.icstack[self.icsp] = self.ic.wrapping_add(1);
                self.dec_icsp();
                self.ic = puop.p16;
            }
            Op::B => {
                self.ic = puop.p16;
            }

            Op::Tap => {
                let idx = ((uop >> 4) & 0xF) as usize;
                self.pc = self.aux[idx];
                self.ic = self.ic.wrapping_add(1);
            }
            Op::Tpa => {
                let idx = ((uop >> 4) & 0xF) as usize;
                self.aux[idx] = self.pc.wrapping_add(puop.p16 as i16 as u16);
                self.ic = self.ic.wrapping_add(1);
            }
            Op::Xpa => {
                let idx = ((uop >> 4) & 0xF) as usize;
                let tmp = self.aux[idx];
                self.aux[idx] = self.pc.wrapping_add(puop.p16 as i16 as u16);
                self.pc = tmp;
                self.ic = self.ic.wrapping_add(1);
            }
            Op::Tps => {
                self.icstack[self.icsp] = self.pc.wrapping_add(puop.p16 as i16 as u16);
                self.dec_icsp();
                self.ic = self.ic.wrapping_add(1);
            }
            Op::Tsp => {
                self.inc_icsp();
                self.pc = self.icstack[self.icsp];
                self.ic = self.ic.wrapping_add(1);
            }
            Op::Sr => {
                self.inc_icsp();
                self.ic = self.icstack[self.icsp];
            }

            Op::Rcm => {
                // the constant rom holds packed bytes; writes never land
                let idx = (self.pc as usize) & (KROM_SIZE - 1);
                self.c = self.krom[idx];
                self.pc = self.pc.wrapping_add(puop.p16 as i16 as u16);
                self.ic = self.ic.wrapping_add(1);
                ticks = 16;
            }
            Op::Wcm => {
                // K-ROM is read-only; the write is silently dropped
                self.ic = self.ic.wrapping_add(1);
                ticks = 16;
            }

            Op::Mr => {
                // load the packed byte holding the addressed nibble
                self.c = {
                    let idx = (self.pc >> 1) as usize;
                    if idx < self.ram.len() {
                        self.ram[idx]
                    } else {
                        0
                    }
                };
                self.pc = self.pc.wrapping_add(puop.p16 as i16 as u16);
                self.ic = self.ic.wrapping_add(1);
            }

            Op::Cio => {
                self.cio(uop);
                self.ic = self.ic.wrapping_add(1);
            }

            Op::Lpi => {
                self.pc = puop.p16;
                self.ic = self.ic.wrapping_add(1);
            }
        }

        Exec::Op { ns: ticks * NS_PER_TICK }
    }
}
