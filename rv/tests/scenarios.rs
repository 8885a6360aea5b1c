//! End-to-end behavioral scenarios driven directly against `Cpu`/`Memory`,
//! without a GDB client in the loop (see `gdb_e2e.rs` for those).

mod common;

use std::cell::RefCell;

use common::*;
use rv::cpu::{Cpu, StepResult};
use rv::memory::{Memory, Perms, Segment};
use rv::syscall::{HostIo, StdHostIo};

#[derive(Default)]
struct CapturingHost {
    stdout: RefCell<String>,
}

impl HostIo for CapturingHost {
    fn read_line(&mut self) -> std::io::Result<String> {
        Ok(String::new())
    }
    fn read_char(&mut self) -> std::io::Result<u8> {
        Ok(0)
    }
    fn write_str(&mut self, s: &str) -> std::io::Result<()> {
        self.stdout.borrow_mut().push_str(s);
        Ok(())
    }
    fn now_millis(&self) -> u64 {
        0
    }
    fn sleep_millis(&self, _ms: u64) {}
}

const TEXT_BASE: u32 = 0x1000;
const DATA_BASE: u32 = 0x8000_0000;

fn assemble(words: &[u32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(words.len() * 4);
    for w in words {
        bytes.extend_from_slice(&w.to_le_bytes());
    }
    bytes
}

fn run_to_exit(cpu: &mut Cpu, mem: &mut Memory, host: &mut dyn HostIo, max_steps: usize) {
    for _ in 0..max_steps {
        match cpu.step(mem, host).expect("no memory fault") {
            StepResult::Exit => return,
            StepResult::Continue | StepResult::Break => continue,
            StepResult::IllegalInstruction => panic!("illegal instruction at {:#x}", cpu.pc),
        }
    }
    panic!("program did not exit within {max_steps} steps");
}

#[test]
fn fibonacci_sequence_is_written_to_memory() {
    // x5=addr x6=a x7=b x8=counter x9=temp
    let loop_idx = 4i32;
    let end_idx = 12i32;

    let words = vec![
        lui(5, DATA_BASE),         // 0: x5 = 0x80000000
        addi(6, X0, 0),            // 1: a = 0
        addi(7, X0, 1),            // 2: b = 1
        addi(8, X0, 16),           // 3: counter = 16
        sw(6, 0, 5),               // 4: loop: store a
        addi(5, 5, 4),             // 5: addr += 4
        addi(8, 8, -1),            // 6: counter -= 1
        beq(8, X0, (end_idx - 7) * 4), // 7: if counter == 0 goto end
        add(9, 6, 7),              // 8: temp = a + b
        addi(6, 7, 0),             // 9: a = b
        addi(7, 9, 0),             // 10: b = temp
        jal(X0, (loop_idx - 11) * 4), // 11: goto loop
        addi(A7, X0, 10),          // 12: end: a7 = 10 (exit)
        ecall(),                   // 13
    ];

    let mut mem = Memory::new();
    mem.add_segment(Segment::new(TEXT_BASE, 0x1000, Perms::READ | Perms::EXEC)).unwrap();
    mem.add_segment(Segment::new(DATA_BASE, 0x1000, Perms::READ | Perms::WRITE)).unwrap();
    mem.write_bytes(TEXT_BASE, &assemble(&words)).unwrap();

    let mut cpu = Cpu::new(TEXT_BASE);
    let mut host = StdHostIo;
    run_to_exit(&mut cpu, &mut mem, &mut host, 1000);

    let expected: [u32; 16] =
        [0, 1, 1, 2, 3, 5, 8, 13, 21, 34, 55, 89, 144, 233, 377, 610];
    for (i, &v) in expected.iter().enumerate() {
        let addr = DATA_BASE + (i as u32) * 4;
        assert_eq!(mem.read32_le(addr).unwrap(), v, "fib[{i}] at {addr:#010x}");
    }
}

#[test]
fn print_string_ecall_writes_exactly_the_nul_terminated_bytes() {
    let words = vec![
        lui(5, 0x2000),    // x5 = 0x2000 (string base, page aligned)
        addi(A0, 5, 0),    // a0 = &string
        addi(A7, X0, 4),   // a7 = 4 (PrintString)
        ecall(),
        addi(A7, X0, 10),  // a7 = 10 (exit)
        ecall(),
    ];

    let mut mem = Memory::new();
    mem.add_segment(Segment::new(TEXT_BASE, 0x1000, Perms::READ | Perms::EXEC)).unwrap();
    mem.add_segment(Segment::new(0x2000, 0x1000, Perms::READ | Perms::WRITE)).unwrap();
    mem.write_bytes(TEXT_BASE, &assemble(&words)).unwrap();
    mem.write_bytes(0x2000, b"hello\0").unwrap();

    let mut cpu = Cpu::new(TEXT_BASE);
    let mut host = CapturingHost::default();
    run_to_exit(&mut cpu, &mut mem, &mut host, 100);

    assert_eq!(host.stdout.borrow().as_str(), "hello");
}
