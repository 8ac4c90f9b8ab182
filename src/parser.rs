// This is where the dirty grunt work of cracking raw microwords happens.
// Predecoding runs when a word is written to the microcode store, never at
// execution time; the result is the MicroWord tuple the interpreters consume.
//
// VP word format (24 bits, odd parity over [23:0], parity bit is [23]):
//
//   [22:18] primary opcode     [15:14] CY preset (0 none, 2 clear, 3 set)
//   [13:12] D field (memory op: 0 none, 1 read, 2 write1, 3 write2)
//   [11:8]  C field (destination)
//   [7:4]   A field            [3:0] B field
//
//   primary opcode map:
//     00..07  OR XOR AND SC DAC DSC AC M     (bit 17 selects the X form)
//     08..0F  ORI XORI ANDI AI DACI DSCI ACI MI
//     10..13  BLR/BLER (odd opcode selects the X form)
//     14 BER   15 SB   16 BNR   17 B
//     18..1F  BT BF BEQ BNE (opcode pairs; the low bit picks the b nibble)
//
//   three mini-op envelopes are tested before primary decode:
//     LPI    (uop & 0x790000) == 0x190000
//     mini   (uop & 0x618000) == 0x018000, sub-op in [20:17]
//     shift  (uop & 0x71C000) == 0x004000
//
// T word format (20 bits, odd parity in bit [19]).  The surviving T
// documentation fixes the register model and the op set but not the bit
// layout, so the layout below is a reconstruction that keeps the VP field
// conventions where they fit:
//
//   [18]    format: 0 = ALU op, 1 = control op
//   ALU:     [17:14] op (0..8 = OR XOR AND SC DAC DSC AC M SH)
//            [13:12] modifier: 0 plain, 1 X (register pair), 2 immediate
//            [11:8] C   [7:4] A or imm   [3:0] B
//   control: [17:14] sub: 0..3 BT BF BEQ BNE (imm [7:4], b [3:0],
//                         target = (ic & !0x3F) | [13:8])
//                    4..7 BLR BLER BER BNR (a [7:4], b [3:0], target as above)
//                    8 SB, 9 B (target [13:0], within the same 16 K bank)
//                    10 mini: sub-op [13:10] = TAP TPA XPA TPS TSP SR RCM
//                             WCM CIO MR; aux index [7:4]; pc offset [9:8]
//                             mapping {0, +1, +2, -1}; CIO s=[9], t=[8:2]
//                    11 LPI (pc immediate [13:0])

use crate::fields::{fetch, MicroWord, Op};

// pc adjustment implied by the A field of VP register ops
const PC_ADJUST_TBL: [i8; 16] = [0, 0, 0, 0, 0, 0, 0, 0, -1, -1, 0, 0, 1, 1, 1, -1];

// 3b field map used by the VP TPA/XPA/TPS ops to adjust pc on store
const INCMAP: [i16; 8] = [0, 1, 2, 3, 0, -1, -2, -3];

// pc offset map of the reconstructed T mini ops
const INCMAP_T: [i16; 4] = [0, 1, 2, -1];

const REG_OPS: [Op; 8] = [Op::Or, Op::Xor, Op::And, Op::Sc, Op::Dac, Op::Dsc, Op::Ac, Op::M];
const REG_OPS_X: [Op; 8] =
    [Op::OrX, Op::XorX, Op::AndX, Op::ScX, Op::DacX, Op::DscX, Op::AcX, Op::MX];
const REG_IMM_OPS: [Op; 8] =
    [Op::Ori, Op::Xori, Op::Andi, Op::Ai, Op::Daci, Op::Dsci, Op::Aci, Op::Mi];

// 10b page branch target
fn page_br(addr: u16, uop: u32) -> u16 {
    (addr & 0xFC00) | (((uop >> 8) & 0x03FF) as u16)
}

// 16b full branch target
fn full_br(uop: u32) -> u16 {
    (((uop >> 8) & 0x03FF) as u16) | (((uop << 8) & 0xFC00) as u16)
}

// 8b immediate of the VP register-immediate ops
pub fn imm8(uop: u32) -> u8 {
    (((uop >> 10) & 0xF0) | ((uop >> 4) & 0x0F)) as u8
}

// parity of the low n bits, true if odd
fn odd_parity(word: u32, bits: u32) -> bool {
    let mut fold = word & ((1u32 << bits) - 1);
    fold ^= fold >> 16;
    fold ^= fold >> 8;
    fold ^= fold >> 4;
    fold ^= fold >> 2;
    fold ^= fold >> 1;
    (fold & 1) != 0
}

// force good (odd) parity on a hand-assembled word; used by the boot
// loaders and the test benches
pub fn with_parity_vp(uop: u32) -> u32 {
    let word = uop & 0x7FFFFF;
    if odd_parity(word, 23) {
        word
    } else {
        word | 0x800000
    }
}

pub fn with_parity_t(uop: u32) -> u32 {
    let word = uop & 0x7FFFF;
    if odd_parity(word, 19) {
        word
    } else {
        word | 0x80000
    }
}

// ------------------------------------------------------------------------
// VP predecode
// ------------------------------------------------------------------------

pub fn predecode_vp(addr: u16, uop: u32) -> MicroWord {
    let uop = uop & 0x00FF_FFFF; // only 24b are meaningful

    let a_field = ((uop >> 4) & 0xF) as usize;
    let c_field = (uop >> 8) & 0xF;
    let d_field = (uop >> 12) & 0x3;

    let lpi_op = (uop & 0x790000) == 0x190000;
    let mini_op = (uop & 0x618000) == 0x018000;
    let shft_op = (uop & 0x71C000) == 0x004000;

    let mut word = MicroWord { uop, op: Op::Illegal, flags: 0, p8: 0, p16: 0 };
    let mut illegal = false; // innocent until proven guilty

    if !odd_parity(uop, 24) {
        word.op = Op::Pecm;
        return word;
    }

    if lpi_op {
        if d_field == 1 {
            word.flags |= fetch::B;
        }
        word.op = Op::Lpi;
        word.p16 = (((uop >> 3) & 0xC000)     // [18:17] -> [15:14]
                  | ((uop >> 2) & 0x3000)     // [15:14] -> [13:12]
                  | (uop & 0x0FFF)) as u16; // [11: 0] -> [11: 0]
    } else if mini_op {
        match (uop >> 17) & 0xF {
            0x5 => {
                illegal = (uop & 0x7F8000) != 0x0B8000;
                if d_field >= 2 {
                    word.flags |= fetch::B;
                }
                word.op = Op::Tap;
            }
            0x0 => {
                illegal = (uop & 0x7F8800) != 0x018000;
                let inc = (((uop >> 12) & 4) | ((uop >> 9) & 3)) as usize;
                if d_field >= 2 {
                    word.flags |= fetch::B;
                }
                word.op = Op::Tpa;
                word.p16 = INCMAP[inc] as u16;
            }
            0x1 => {
                illegal = (uop & 0x7F8800) != 0x038000;
                let inc = (((uop >> 12) & 4) | ((uop >> 9) & 3)) as usize;
                if d_field >= 2 {
                    word.flags |= fetch::B;
                }
                word.op = Op::Xpa;
                word.p16 = INCMAP[inc] as u16;
            }
            0x2 => {
                illegal = (uop & 0x7F8800) != 0x058000;
                let inc = (((uop >> 12) & 4) | ((uop >> 9) & 3)) as usize;
                if d_field >= 2 {
                    word.flags |= fetch::B;
                }
                word.op = Op::Tps;
                word.p16 = INCMAP[inc] as u16;
            }
            0x6 => {
                illegal = (uop & 0x7F8800) != 0x0D8000;
                if d_field >= 2 {
                    word.flags |= fetch::B;
                }
                word.op = Op::Tsp;
            }
            0x3 => {
                // subroutine return, perhaps with a control memory access
                if (uop & 0x7F8E00) == 0x078600 {
                    word.op = Op::Rcm;
                } else if (uop & 0x7F8E00) == 0x078400 {
                    word.op = Op::Wcm;
                } else if (uop & 0x7F8C00) == 0x078000 {
                    if d_field >= 2 {
                        word.flags |= fetch::B;
                    }
                    word.op = Op::Sr;
                } else {
                    illegal = true;
                }
            }
            0xB => {
                illegal = (uop & 0x7FB000) != 0x178000;
                word.op = Op::Cio;
            }
            _ => {
                illegal = true;
            }
        }
    } else if shft_op {
        let x_field = (uop >> 17) & 1;
        if x_field != 0 {
            illegal = c_field == 9 || c_field == 10 || c_field == 11;
            word.flags |= fetch::X;
            word.op = Op::ShX;
        } else {
            illegal = c_field == 10 || c_field == 11;
            word.flags |= fetch::AB;
            word.op = Op::Sh;
            word.p16 = PC_ADJUST_TBL[a_field] as i16 as u16;
        }
    } else {
        let op = ((uop >> 18) & 0x1F) as usize;
        match op {
            // register instructions
            0x00..=0x07 => {
                if op <= 0x06 && ((uop >> 14) & 3) >= 2 {
                    word.flags |= fetch::CY; // clear or set
                }
                illegal = (uop & 0x010000) != 0;
                let x_field = (uop >> 17) & 1;
                if x_field != 0 {
                    illegal |= c_field == 9 || c_field == 10 || c_field == 11;
                    word.flags |= fetch::X;
                    word.op = REG_OPS_X[op];
                } else {
                    illegal |= c_field == 10 || c_field == 11;
                    word.flags |= fetch::AB;
                    word.op = REG_OPS[op];
                    word.p16 = PC_ADJUST_TBL[a_field] as i16 as u16;
                }
            }

            // register immediate instructions
            0x08..=0x0F => {
                illegal = c_field == 10 || c_field == 11;
                word.flags |= fetch::B;
                word.op = REG_IMM_OPS[op - 0x08];
            }

            // register branch instructions
            0x10 | 0x11 | 0x12 | 0x13 | 0x14 | 0x16 => {
                let x_field = (uop >> 18) & 1;
                if (op <= 0x13) && x_field != 0 {
                    word.flags |= fetch::X;
                    word.op = if op <= 0x11 { Op::BlrX } else { Op::BlerX };
                } else {
                    word.flags |= fetch::AB;
                    word.op = match op {
                        0x10 | 0x11 => Op::Blr,
                        0x12 | 0x13 => Op::Bler,
                        0x14 => Op::Ber,
                        _ => Op::Bnr,
                    };
                }
                word.p8 = PC_ADJUST_TBL[a_field];
                word.p16 = page_br(addr, uop);
            }

            // branch instructions
            0x15 => {
                word.op = Op::Sb;
                word.p16 = full_br(uop);
            }
            0x17 => {
                word.op = Op::B;
                word.p16 = full_br(uop);
            }

            // mask branch instructions
            0x18 | 0x19 => {
                word.flags |= fetch::B;
                word.op = Op::Bt;
                word.p16 = page_br(addr, uop);
            }
            0x1A | 0x1B => {
                word.flags |= fetch::B;
                word.op = Op::Bf;
                word.p16 = page_br(addr, uop);
            }
            0x1C | 0x1D => {
                word.flags |= fetch::B;
                word.op = Op::Beq;
                word.p16 = page_br(addr, uop);
            }
            0x1E | 0x1F => {
                word.flags |= fetch::B;
                word.op = Op::Bne;
                word.p16 = page_br(addr, uop);
            }

            _ => unreachable!(),
        }
    }

    if illegal {
        return MicroWord::illegal(uop);
    }
    word
}

// ------------------------------------------------------------------------
// T predecode (reconstructed layout, see the module comment)
// ------------------------------------------------------------------------

fn page_br_t(addr: u16, uop: u32) -> u16 {
    (addr & !0x3F) | (((uop >> 8) & 0x3F) as u16)
}

pub fn predecode_t(addr: u16, uop: u32) -> MicroWord {
    let uop = uop & 0x000F_FFFF; // only 20b are meaningful

    let mut word = MicroWord { uop, op: Op::Illegal, flags: 0, p8: 0, p16: 0 };

    if !odd_parity(uop, 20) {
        word.op = Op::Pecm;
        return word;
    }

    let control = (uop >> 18) & 1;
    let sub = ((uop >> 14) & 0xF) as usize;

    if control == 0 {
        // ALU op
        let modifier = (uop >> 12) & 3;
        if sub > 8 {
            return MicroWord::illegal(uop);
        }
        match modifier {
            0 => {
                word.flags |= fetch::AB;
                word.op = if sub == 8 { Op::Sh } else { REG_OPS[sub] };
            }
            1 => {
                word.flags |= fetch::X;
                word.op = if sub == 8 { Op::ShX } else { REG_OPS_X[sub] };
            }
            2 => {
                if sub == 8 {
                    return MicroWord::illegal(uop); // no SHI form
                }
                word.flags |= fetch::B;
                word.op = REG_IMM_OPS[sub];
            }
            _ => return MicroWord::illegal(uop),
        }
    } else {
        match sub {
            0 | 1 | 2 | 3 => {
                word.flags |= fetch::B;
                word.op = [Op::Bt, Op::Bf, Op::Beq, Op::Bne][sub];
                word.p16 = page_br_t(addr, uop);
            }
            4 | 5 | 6 | 7 => {
                word.flags |= fetch::AB;
                word.op = [Op::Blr, Op::Bler, Op::Ber, Op::Bnr][sub - 4];
                word.p16 = page_br_t(addr, uop);
            }
            8 => {
                word.op = Op::Sb;
                word.p16 = (addr & 0xC000) | ((uop & 0x3FFF) as u16);
            }
            9 => {
                word.op = Op::B;
                word.p16 = (addr & 0xC000) | ((uop & 0x3FFF) as u16);
            }
            10 => {
                let inc = INCMAP_T[((uop >> 8) & 3) as usize];
                word.p16 = inc as u16;
                word.op = match (uop >> 10) & 0xF {
                    0 => Op::Tap,
                    1 => Op::Tpa,
                    2 => Op::Xpa,
                    3 => Op::Tps,
                    4 => Op::Tsp,
                    5 => Op::Sr,
                    6 => Op::Rcm,
                    7 => Op::Wcm,
                    8 => Op::Cio,
                    9 => Op::Mr,
                    _ => return MicroWord::illegal(uop),
                };
            }
            11 => {
                word.op = Op::Lpi;
                word.p16 = (uop & 0x3FFF) as u16;
            }
            _ => return MicroWord::illegal(uop),
        }
    }

    word
}

// ------------------------------------------------------------------------
// disassembly
// ------------------------------------------------------------------------
// one line per word, used when an illegal op is surfaced to the host and
// by the debug traces.

fn operand_name_vp(spec: u32) -> String {
    match spec {
        0..=7 => format!("R{}", spec),
        8 => "PL".to_string(),
        9 => "PH".to_string(),
        10 => "CL".to_string(),
        11 => "CH".to_string(),
        12 => "SL".to_string(),
        13 => "SH".to_string(),
        14 => "K".to_string(),
        _ => "-".to_string(),
    }
}

pub fn dasm_one_vp(addr: u16, word: &MicroWord) -> String {
    let uop = word.uop;
    let a = (uop >> 4) & 0xF;
    let b = uop & 0xF;
    let c = (uop >> 8) & 0xF;
    let mn = word.op.mnemonic();
    let body = match word.op {
        Op::Pecm | Op::Illegal => String::new(),
        Op::Sb | Op::B => format!(" 0x{:04X}", word.p16),
        Op::Bt | Op::Bf | Op::Beq | Op::Bne => {
            format!(" {},#0x{:X},0x{:04X}", operand_name_vp(b), (uop >> 4) & 0xF, word.p16)
        }
        Op::Blr | Op::Bler | Op::Ber | Op::Bnr | Op::BlrX | Op::BlerX => {
            format!(" {},{},0x{:04X}", operand_name_vp(a), operand_name_vp(b), word.p16)
        }
        Op::Lpi => format!(" #0x{:04X}", word.p16),
        Op::Tap | Op::Tpa | Op::Xpa => format!(" AUX{}", (uop >> 4) & 0x1F),
        Op::Tps | Op::Tsp | Op::Sr | Op::Rcm | Op::Wcm => String::new(),
        Op::Cio => format!(" #0x{:02X}", (uop >> 4) & 0x7F),
        Op::Ori | Op::Xori | Op::Andi | Op::Ai | Op::Daci | Op::Dsci | Op::Aci | Op::Mi => {
            format!(" #0x{:02X},{} -> {}", imm8(uop), operand_name_vp(b), operand_name_vp(c))
        }
        _ => format!(" {},{} -> {}", operand_name_vp(a), operand_name_vp(b), operand_name_vp(c)),
    };
    format!("{:04X}: {:06X}  {}{}", addr, uop, mn, body)
}

pub fn dasm_one_t(addr: u16, word: &MicroWord) -> String {
    format!("{:04X}: {:05X}  {}", addr, word.uop, word.op.mnemonic())
}
