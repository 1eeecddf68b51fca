//! A small deterministic instruction set for driving the protocol.
//!
//! Programs loop forever over their instruction list; the driver bounds
//! execution by an instruction budget. State lives in an [`ArchSnapshot`]
//! (integer registers `r0..r7`, pc in `snapshot.pc`), so main units and
//! checkers share one execution function and differ only in their
//! [`DataPort`].

use lockstep_core::{ArchSnapshot, PcState, RegisterLayout, ThreadState};
use lockstep_error::Result;
use lockstep_types::RegClass;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Address of the first instruction.
pub const CODE_BASE: u64 = 0x400;
/// Base of the data window addressed through `r7`.
pub const DATA_BASE: u64 = 0x1_0000;
/// Bytes of the data window used by generated programs.
pub const DATA_WINDOW: u64 = 256;
/// Integer registers the instruction set names.
pub const TOY_REGS: usize = 8;
/// Register holding the data base in generated programs.
pub const BASE_REG: u8 = 7;
/// Bytes per instruction.
pub const INSTR_BYTES: u64 = 4;

// ---------------------------------------------------------------------------
// Instructions
// ---------------------------------------------------------------------------

/// Functional-unit class of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpClass {
    NoOp,
    IntAlu,
    MemRead,
    MemWrite,
    Syscall,
}

impl OpClass {
    pub const ALL: [Self; 5] = [
        Self::NoOp,
        Self::IntAlu,
        Self::MemRead,
        Self::MemWrite,
        Self::Syscall,
    ];

    /// Numeric id used by stuck-at specs.
    pub const fn id(self) -> u32 {
        self as u32
    }

    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|class| class.id() == id)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoOp => "no_op",
            Self::IntAlu => "int_alu",
            Self::MemRead => "mem_read",
            Self::MemWrite => "mem_write",
            Self::Syscall => "syscall",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|class| class.as_str() == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instr {
    Li { rd: u8, imm: u64 },
    Add { rd: u8, rs1: u8, rs2: u8 },
    AddI { rd: u8, rs: u8, imm: u64 },
    Xor { rd: u8, rs1: u8, rs2: u8 },
    /// Zero-extending little-endian load of `size` bytes.
    Load { rd: u8, base: u8, offset: u64, size: u8 },
    /// Little-endian store of the low `size` bytes of `rs`.
    Store { rs: u8, base: u8, offset: u64, size: u8 },
    /// Atomic 8-byte exchange of `rs` with memory; the old value lands in `rd`.
    Swap { rd: u8, rs: u8, base: u8, offset: u64 },
    /// Result lands in `r0`.
    Syscall { num: u64 },
    Nop,
}

impl Instr {
    pub const fn dest(self) -> Option<u8> {
        match self {
            Self::Li { rd, .. }
            | Self::Add { rd, .. }
            | Self::AddI { rd, .. }
            | Self::Xor { rd, .. }
            | Self::Load { rd, .. }
            | Self::Swap { rd, .. } => Some(rd),
            Self::Syscall { .. } => Some(0),
            Self::Store { .. } | Self::Nop => None,
        }
    }

    pub const fn op_class(self) -> OpClass {
        match self {
            Self::Li { .. } | Self::Add { .. } | Self::AddI { .. } | Self::Xor { .. } => {
                OpClass::IntAlu
            }
            Self::Load { .. } => OpClass::MemRead,
            Self::Store { .. } | Self::Swap { .. } => OpClass::MemWrite,
            Self::Syscall { .. } => OpClass::Syscall,
            Self::Nop => OpClass::NoOp,
        }
    }

    /// Static name used in coverage reports.
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Self::Li { .. } => "li",
            Self::Add { .. } => "add",
            Self::AddI { .. } => "addi",
            Self::Xor { .. } => "xor",
            Self::Load { .. } => "ld",
            Self::Store { .. } => "st",
            Self::Swap { .. } => "swp",
            Self::Syscall { .. } => "syscall",
            Self::Nop => "nop",
        }
    }
}

// ---------------------------------------------------------------------------
// Program
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    instrs: Vec<Instr>,
}

impl Program {
    pub fn new(instrs: Vec<Instr>) -> Self {
        let instrs = if instrs.is_empty() {
            vec![Instr::Nop]
        } else {
            instrs
        };
        Self { instrs }
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    pub fn instrs(&self) -> &[Instr] {
        &self.instrs
    }

    fn index_of(&self, pc: u64) -> usize {
        let slot = pc.wrapping_sub(CODE_BASE) / INSTR_BYTES;
        usize::try_from(slot % self.instrs.len() as u64).unwrap_or(0)
    }

    pub fn fetch(&self, pc: u64) -> Instr {
        self.instrs[self.index_of(pc)]
    }

    /// Pc after `pc`, wrapping to the top of the loop.
    pub fn next_pc(&self, pc: u64) -> u64 {
        let next = (self.index_of(pc) + 1) % self.instrs.len();
        CODE_BASE + next as u64 * INSTR_BYTES
    }

    /// Fixed loop touching every instruction kind; its first memory access
    /// is a store.
    pub fn demo() -> Self {
        use Instr::{Add, AddI, Li, Load, Nop, Store, Swap, Syscall, Xor};
        Self::new(vec![
            Li { rd: BASE_REG, imm: DATA_BASE },
            Li { rd: 1, imm: 0x1234 },
            Store { rs: 1, base: BASE_REG, offset: 0, size: 8 },
            Load { rd: 2, base: BASE_REG, offset: 0, size: 8 },
            AddI { rd: 1, rs: 1, imm: 3 },
            Add { rd: 3, rs1: 2, rs2: 1 },
            Store { rs: 3, base: BASE_REG, offset: 8, size: 8 },
            Xor { rd: 4, rs1: 3, rs2: 2 },
            Swap { rd: 5, rs: 4, base: BASE_REG, offset: 16 },
            Load { rd: 6, base: BASE_REG, offset: 8, size: 4 },
            Nop,
            Syscall { num: 1 },
            Add { rd: 1, rs1: 1, rs2: 0 },
            Store { rs: 5, base: BASE_REG, offset: 24, size: 2 },
        ])
    }

    /// Seeded random loop of `len` instructions after the base setup.
    ///
    /// Never writes `r7`; memory offsets are 8-byte aligned inside the data
    /// window.
    pub fn random(seed: u64, len: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut instrs = vec![Instr::Li {
            rd: BASE_REG,
            imm: DATA_BASE,
        }];
        let reg = |rng: &mut StdRng| rng.gen_range(0..BASE_REG);
        let any_reg = |rng: &mut StdRng| rng.gen_range(0..=BASE_REG);
        let offset = |rng: &mut StdRng| rng.gen_range(0..DATA_WINDOW / 8) * 8;
        for _ in 0..len {
            let instr = match rng.gen_range(0..100_u32) {
                0..=9 => Instr::Li {
                    rd: reg(&mut rng),
                    imm: rng.r#gen(),
                },
                10..=24 => Instr::Add {
                    rd: reg(&mut rng),
                    rs1: any_reg(&mut rng),
                    rs2: any_reg(&mut rng),
                },
                25..=34 => Instr::AddI {
                    rd: reg(&mut rng),
                    rs: any_reg(&mut rng),
                    imm: rng.gen_range(0..1024),
                },
                35..=44 => Instr::Xor {
                    rd: reg(&mut rng),
                    rs1: any_reg(&mut rng),
                    rs2: any_reg(&mut rng),
                },
                45..=64 => Instr::Load {
                    rd: reg(&mut rng),
                    base: BASE_REG,
                    offset: offset(&mut rng),
                    size: [1, 2, 4, 8][rng.gen_range(0..4)],
                },
                65..=84 => Instr::Store {
                    rs: any_reg(&mut rng),
                    base: BASE_REG,
                    offset: offset(&mut rng),
                    size: [1, 2, 4, 8][rng.gen_range(0..4)],
                },
                85..=91 => Instr::Swap {
                    rd: reg(&mut rng),
                    rs: any_reg(&mut rng),
                    base: BASE_REG,
                    offset: offset(&mut rng),
                },
                92..=94 => Instr::Syscall {
                    num: rng.gen_range(0..4),
                },
                _ => Instr::Nop,
            };
            instrs.push(instr);
        }
        Self::new(instrs)
    }
}

// ---------------------------------------------------------------------------
// Cpu
// ---------------------------------------------------------------------------

/// Register state of one execution unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cpu {
    pub state: ArchSnapshot,
}

impl Cpu {
    /// Zeroed registers with the pc at the top of the program.
    pub fn reset() -> Self {
        let mut state = ArchSnapshot::zeroed(RegisterLayout::default());
        state.pc = PcState {
            pc: CODE_BASE,
            npc: CODE_BASE + INSTR_BYTES,
            micro_pc: 0,
        };
        Self { state }
    }

    pub fn pc(&self) -> u64 {
        self.state.pc.pc
    }

    pub fn reg(&self, index: u8) -> u64 {
        read_reg(&self.state, index)
    }
}

impl ThreadState for Cpu {
    fn snapshot(&self) -> ArchSnapshot {
        self.state.clone()
    }

    fn restore(&mut self, snapshot: &ArchSnapshot) {
        self.state = snapshot.detached();
    }
}

fn read_reg(state: &ArchSnapshot, index: u8) -> u64 {
    state.reg(RegClass::Int, usize::from(index)).unwrap_or(0)
}

fn write_reg(state: &mut ArchSnapshot, index: u8, value: u64) {
    state.set_reg(RegClass::Int, usize::from(index), value);
}

/// Little-endian encoding of the low `size` bytes of `value`.
pub fn encode_word(value: u64, size: usize) -> Vec<u8> {
    value.to_le_bytes()[..size.min(8)].to_vec()
}

/// Zero-extending little-endian decode of up to 8 bytes.
pub fn decode_word(bytes: &[u8]) -> u64 {
    let mut word = [0_u8; 8];
    let n = bytes.len().min(8);
    word[..n].copy_from_slice(&bytes[..n]);
    u64::from_le_bytes(word)
}

/// Deterministic system-call result derived from the caller's registers.
pub fn syscall_result(num: u64, state: &ArchSnapshot) -> u64 {
    let seed = read_reg(state, 1) ^ num.rotate_left(17);
    seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ (seed >> 29)
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// What a system call handed back to the executing unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyscallOutcome {
    pub result: u64,
    /// Complete post-call state to install instead of writing `r0`.
    pub install: Option<ArchSnapshot>,
}

/// Memory and system-call side of an execution unit.
///
/// `Ok(None)` (or `Ok(false)`) stalls the instruction; the caller retries
/// it later from the same state.
pub trait DataPort {
    fn load(&mut self, addr: u64, size: usize) -> Result<Option<Vec<u8>>>;

    fn store(&mut self, addr: u64, data: &[u8]) -> Result<bool>;

    /// Write `data` and return the bytes it replaced.
    fn swap(&mut self, addr: u64, data: &[u8]) -> Result<Option<Vec<u8>>>;

    fn syscall(&mut self, pc: u64, num: u64, state: &ArchSnapshot)
    -> Result<Option<SyscallOutcome>>;
}

/// Execute `instr` on a copy of `state`.
///
/// Returns the post-commit state, or `None` when the port stalled.
pub fn execute(
    program: &Program,
    state: &ArchSnapshot,
    port: &mut dyn DataPort,
) -> Result<Option<ArchSnapshot>> {
    let pc = state.pc.pc;
    let instr = program.fetch(pc);
    let mut next = state.clone();
    let ea = |base: u8, offset: u64| read_reg(state, base).wrapping_add(offset);
    match instr {
        Instr::Li { rd, imm } => write_reg(&mut next, rd, imm),
        Instr::Add { rd, rs1, rs2 } => {
            write_reg(&mut next, rd, read_reg(state, rs1).wrapping_add(read_reg(state, rs2)));
        }
        Instr::AddI { rd, rs, imm } => {
            write_reg(&mut next, rd, read_reg(state, rs).wrapping_add(imm));
        }
        Instr::Xor { rd, rs1, rs2 } => {
            write_reg(&mut next, rd, read_reg(state, rs1) ^ read_reg(state, rs2));
        }
        Instr::Load {
            rd,
            base,
            offset,
            size,
        } => {
            let Some(bytes) = port.load(ea(base, offset), usize::from(size))? else {
                return Ok(None);
            };
            write_reg(&mut next, rd, decode_word(&bytes));
        }
        Instr::Store {
            rs,
            base,
            offset,
            size,
        } => {
            let data = encode_word(read_reg(state, rs), usize::from(size));
            if !port.store(ea(base, offset), &data)? {
                return Ok(None);
            }
        }
        Instr::Swap {
            rd,
            rs,
            base,
            offset,
        } => {
            let data = encode_word(read_reg(state, rs), 8);
            let Some(old) = port.swap(ea(base, offset), &data)? else {
                return Ok(None);
            };
            write_reg(&mut next, rd, decode_word(&old));
        }
        Instr::Syscall { num } => {
            let Some(outcome) = port.syscall(pc, num, state)? else {
                return Ok(None);
            };
            if let Some(installed) = outcome.install {
                return Ok(Some(installed));
            }
            write_reg(&mut next, 0, outcome.result);
        }
        Instr::Nop => {}
    }
    let npc = program.next_pc(pc);
    next.pc = PcState {
        pc: npc,
        npc: program.next_pc(npc),
        micro_pc: 0,
    };
    Ok(Some(next))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    /// Flat memory port that never stalls.
    #[derive(Default)]
    struct Flat {
        bytes: BTreeMap<u64, u8>,
        stall: bool,
    }

    impl DataPort for Flat {
        fn load(&mut self, addr: u64, size: usize) -> Result<Option<Vec<u8>>> {
            if self.stall {
                return Ok(None);
            }
            Ok(Some(
                (0..size as u64)
                    .map(|i| self.bytes.get(&(addr + i)).copied().unwrap_or(0))
                    .collect(),
            ))
        }

        fn store(&mut self, addr: u64, data: &[u8]) -> Result<bool> {
            for (i, b) in (0_u64..).zip(data) {
                self.bytes.insert(addr + i, *b);
            }
            Ok(true)
        }

        fn swap(&mut self, addr: u64, data: &[u8]) -> Result<Option<Vec<u8>>> {
            let old = self.load(addr, data.len())?;
            self.store(addr, data)?;
            Ok(old)
        }

        fn syscall(
            &mut self,
            _pc: u64,
            num: u64,
            state: &ArchSnapshot,
        ) -> Result<Option<SyscallOutcome>> {
            Ok(Some(SyscallOutcome {
                result: syscall_result(num, state),
                install: None,
            }))
        }
    }

    fn run(program: &Program, port: &mut Flat, steps: usize) -> Cpu {
        let mut cpu = Cpu::reset();
        for _ in 0..steps {
            cpu.state = execute(program, &cpu.state, port).unwrap().unwrap();
        }
        cpu
    }

    #[test]
    fn test_demo_program_semantics() {
        let program = Program::demo();
        let mut port = Flat::default();
        let cpu = run(&program, &mut port, 10);
        assert_eq!(cpu.reg(BASE_REG), DATA_BASE);
        assert_eq!(cpu.reg(2), 0x1234);
        assert_eq!(cpu.reg(1), 0x1237);
        assert_eq!(cpu.reg(3), 0x1234 + 0x1237);
        assert_eq!(cpu.reg(4), (0x1234 + 0x1237) ^ 0x1234);
        assert_eq!(cpu.reg(5), 0, "swap returns the old zero word");
        assert_eq!(cpu.reg(6), 0x1234 + 0x1237);
        assert_eq!(cpu.pc(), CODE_BASE + 10 * INSTR_BYTES);
    }

    #[test]
    fn test_program_wraps() {
        let program = Program::new(vec![Instr::Nop, Instr::Nop]);
        assert_eq!(program.next_pc(CODE_BASE + INSTR_BYTES), CODE_BASE);
        assert_eq!(program.fetch(CODE_BASE + 2 * INSTR_BYTES), Instr::Nop);
        assert_eq!(Program::new(Vec::new()).len(), 1);
    }

    #[test]
    fn test_stalled_port_leaves_state_untouched() {
        let program = Program::new(vec![Instr::Load {
            rd: 1,
            base: 0,
            offset: 0,
            size: 8,
        }]);
        let mut port = Flat {
            stall: true,
            ..Flat::default()
        };
        let cpu = Cpu::reset();
        assert!(execute(&program, &cpu.state, &mut port).unwrap().is_none());
    }

    #[test]
    fn test_random_program_keeps_base_register() {
        let program = Program::random(42, 200);
        assert_eq!(program.len(), 201);
        assert_eq!(program, Program::random(42, 200));
        for instr in &program.instrs()[1..] {
            assert_ne!(instr.dest(), Some(BASE_REG), "{instr:?} clobbers the base");
            if let Instr::Load { offset, .. } | Instr::Store { offset, .. } = instr {
                assert_eq!(offset % 8, 0);
                assert!(*offset < DATA_WINDOW);
            }
        }
    }

    #[test]
    fn test_word_codec() {
        assert_eq!(encode_word(0x0102_0304, 2), vec![0x04, 0x03]);
        assert_eq!(decode_word(&[0x04, 0x03]), 0x0304);
        assert_eq!(decode_word(&encode_word(u64::MAX, 8)), u64::MAX);
    }

    #[test]
    fn test_op_class_ids() {
        for class in OpClass::ALL {
            assert_eq!(OpClass::from_id(class.id()), Some(class));
            assert_eq!(OpClass::from_name(class.as_str()), Some(class));
        }
        assert_eq!(Instr::Syscall { num: 0 }.dest(), Some(0));
        assert_eq!(Instr::Nop.op_class(), OpClass::NoOp);
    }
}
