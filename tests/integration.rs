//! End-to-end measurements in a real subject process.
//!
//! These need ptrace and a hardware cycle counter. Where the host refuses
//! either, the test prints why and passes.

#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

use bhive::arena::{host_page_size, ArenaLayout, AuxOffsets};
use bhive::orchestrator::Measurement;
use bhive::{EventSink, Harness, HarnessConfig, HarnessError, HarnessEvent, RecordingSink};
use nix::sys::signal;
use nix::unistd::Pid;
use std::sync::{Arc, Mutex};

// mov rax, [rbx]
const LOAD_RBX: &[u8] = &[0x48, 0x8b, 0x03];
// mov rax, [rbx + 0x1000]; mov rax, [rbx + 0x2000]
const LOAD_RBX_PLUS_PAGES: &[u8] = &[
    0x48, 0x8b, 0x83, 0x00, 0x10, 0x00, 0x00, //
    0x48, 0x8b, 0x83, 0x00, 0x20, 0x00, 0x00,
];
// mov rax, [0xffffffff80000000]
const LOAD_KERNEL_HALF: &[u8] = &[0x48, 0x8b, 0x04, 0x25, 0x00, 0x00, 0x00, 0x80];
// push rax
const PUSH_RAX: &[u8] = &[0x50];
// mov [rbp - 0x10], rbx
const STORE_BELOW_FP: &[u8] = &[0x48, 0x89, 0x5d, 0xf0];

/// `mov [moffs64], rax` aimed at the perf fd slot of the aux page.
fn store_into_perf_fd_slot() -> Vec<u8> {
    let slot = ArenaLayout::aux_addr_for(host_page_size()) + AuxOffsets::get().perf_fd as u64;
    let mut block = vec![0x48, 0xa3];
    block.extend_from_slice(&slot.to_le_bytes());
    block
}

fn config() -> HarnessConfig {
    HarnessConfig {
        pin_to_core: None,
        ..Default::default()
    }
}

fn run(
    config: HarnessConfig,
    block: &[u8],
    unroll: u32,
) -> (Option<Result<Measurement, HarnessError>>, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::new());
    let harness = Harness::new(config).unwrap().with_sink(sink.clone());
    match harness.measure(block, unroll) {
        Err(e) if e.is_environmental() => {
            eprintln!("skipping: {}", e);
            (None, sink)
        }
        result => (Some(result), sink),
    }
}

fn spawned_pid(sink: &RecordingSink) -> Option<Pid> {
    sink.events().iter().find_map(|e| match e {
        HarnessEvent::SubjectSpawned { pid } => Some(Pid::from_raw(*pid)),
        _ => None,
    })
}

fn assert_reaped(sink: &RecordingSink) {
    if let Some(pid) = spawned_pid(sink) {
        assert!(signal::kill(pid, None).is_err(), "subject {} still exists", pid);
        assert!(sink
            .events()
            .contains(&HarnessEvent::SubjectTerminated { pid: pid.as_raw() }));
    }
}

#[test]
fn nop_block_measures_without_faults() {
    let config = HarnessConfig {
        iterations: 10_000,
        ..config()
    };
    let (result, sink) = run(config, &[0x90], 1);
    let Some(result) = result else { return };
    let m = result.unwrap();
    assert!(m.cycles > 0);
    assert_eq!(m.faults, 0);
    assert_eq!(m.iterations, 10_000);
    assert_eq!(m.block_len, 1);
    assert_reaped(&sink);
}

#[test]
fn load_through_register_faults_once() {
    let (result, sink) = run(config(), LOAD_RBX, 10);
    let Some(result) = result else { return };
    let m = result.unwrap();
    assert_eq!(m.faults, 1);
    assert_eq!(m.restarts, 1);
    assert!(m.cycles > 0);

    let redirected = sink
        .events()
        .iter()
        .filter(|e| matches!(e, HarnessEvent::FaultRedirected { address: 0x2324000, .. }))
        .count();
    assert_eq!(redirected, 1);
    assert_reaped(&sink);
}

#[test]
fn fault_budget_bounds_distinct_pages() {
    let mut block = LOAD_RBX.to_vec();
    block.extend_from_slice(LOAD_RBX_PLUS_PAGES);

    let tight = HarnessConfig {
        max_faults: 2,
        ..config()
    };
    let (result, sink) = run(tight, &block, 4);
    let Some(result) = result else { return };
    assert!(matches!(
        result,
        Err(HarnessError::FaultBudgetExhausted { max_faults: 2, .. })
    ));
    assert_reaped(&sink);

    let enough = HarnessConfig {
        max_faults: 3,
        ..config()
    };
    let (result, sink) = run(enough, &block, 4);
    let m = result.unwrap().unwrap();
    assert_eq!(m.faults, 3);
    assert_eq!(m.restarts, 3);
    assert_reaped(&sink);
}

#[test]
fn stack_overflow_faults_below_the_arena() {
    // 1000 pushes run off the bottom of the stack page twice
    let (result, sink) = run(config(), PUSH_RAX, 1000);
    let Some(result) = result else { return };
    let m = result.unwrap();
    assert_eq!(m.faults, 2);
    assert_eq!(m.restarts, 2);
    assert!(m.cycles > 0);

    let layout_base = ArenaLayout::aux_addr_for(host_page_size()) - 2 * host_page_size();
    for event in sink.events() {
        if let HarnessEvent::FaultRedirected { address, .. } = event {
            assert!(address < layout_base, "{:#x}", address);
        }
    }
    assert_reaped(&sink);
}

#[test]
fn clobbered_frame_does_not_disturb_the_counter() {
    let (clean, _) = run(config(), LOAD_RBX, 10);
    let Some(clean) = clean else { return };
    let clean = clean.unwrap();

    let mut block = STORE_BELOW_FP.to_vec();
    block.extend_from_slice(LOAD_RBX);
    let (result, sink) = run(config(), &block, 10);
    let Some(result) = result else { return };
    let m = result.unwrap();
    assert_eq!(m.faults, 1);
    assert!(m.cycles > 0);
    assert!(
        m.cycles < 4 * clean.cycles.max(1),
        "{} against {}",
        m.cycles,
        clean.cycles
    );
    assert_reaped(&sink);
}

#[test]
fn clobbered_perf_fd_is_reported() {
    let mut block = store_into_perf_fd_slot();
    block.extend_from_slice(LOAD_RBX);
    let (result, sink) = run(config(), &block, 1);
    let Some(result) = result else { return };
    assert_eq!(result, Err(HarnessError::CounterControl { errno: libc::EBADF }));
    assert_reaped(&sink);
}

#[test]
fn failed_pin_is_reported() {
    let config = HarnessConfig {
        pin_to_core: Some(libc::CPU_SETSIZE as usize - 1),
        ..config()
    };
    let (result, sink) = run(config, &[0x90], 1);
    let Some(result) = result else { return };
    let m = result.unwrap();
    // no host has that many CPUs
    assert_eq!(m.pinned_core, None);
    assert!(sink
        .events()
        .iter()
        .any(|e| matches!(e, HarnessEvent::PinFailed { errno: libc::EINVAL, .. })));
}

#[test]
fn unmappable_address_exhausts_budget() {
    let config = HarnessConfig {
        max_faults: 8,
        ..config()
    };
    let (result, sink) = run(config, LOAD_KERNEL_HALF, 1);
    let Some(result) = result else { return };
    match result {
        Err(HarnessError::FaultBudgetExhausted {
            max_faults,
            last_address,
        }) => {
            assert_eq!(max_faults, 8);
            assert_eq!(last_address, 0xffff_ffff_8000_0000);
        }
        other => panic!("expected budget exhaustion, got {:?}", other),
    }
    assert_reaped(&sink);
}

#[test]
fn zero_unroll_is_rejected_without_a_subject() {
    let (result, sink) = run(config(), &[0x90], 0);
    assert!(matches!(result, Some(Err(HarnessError::InvalidInput(_)))));
    assert!(spawned_pid(&sink).is_none());
}

#[test]
fn unknown_event_is_reported_by_the_subject() {
    let config = HarnessConfig {
        event: "cycles:k".to_string(),
        ..config()
    };
    let (result, sink) = run(config, &[0x90], 1);
    let Some(result) = result else { return };
    assert!(matches!(result, Err(HarnessError::CounterResolution(_))));
    assert_reaped(&sink);
}

#[test]
fn more_iterations_never_count_less() {
    let measure = |iterations| {
        let config = HarnessConfig {
            iterations,
            ..config()
        };
        run(config, &[0x48, 0x01, 0xc0], 100).0
    };
    let Some(short) = measure(100) else { return };
    let Some(long) = measure(100_000) else { return };
    assert!(long.unwrap().cycles >= short.unwrap().cycles);
}

#[test]
fn relocated_stack_verifies() {
    let (result, sink) = run(config(), &[0x90], 1);
    let Some(result) = result else { return };
    let m = result.unwrap();
    assert!(m.relocated_words > 0);
    let events = sink.events();
    assert!(!events
        .iter()
        .any(|e| matches!(e, HarnessEvent::RelocationMismatch { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, HarnessEvent::StackRelocated { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, HarnessEvent::ImageVerified { .. })));
}

/// Lists the subject's open descriptors while it is stopped in the entry stub.
#[derive(Default)]
struct DescriptorSink {
    recording: RecordingSink,
    links: Mutex<Vec<String>>,
}

impl EventSink for DescriptorSink {
    fn emit(&self, event: &HarnessEvent) {
        if let HarnessEvent::SubjectStopped { pid, .. } = event {
            if let Ok(dir) = std::fs::read_dir(format!("/proc/{}/fd", pid)) {
                let links = dir
                    .filter_map(|e| e.ok())
                    .filter_map(|e| std::fs::read_link(e.path()).ok())
                    .map(|l| l.to_string_lossy().into_owned());
                self.links.lock().unwrap().extend(links);
            }
        }
        self.recording.emit(event);
    }
}

#[test]
fn arena_is_not_reachable_by_name() {
    let sink = Arc::new(DescriptorSink::default());
    let harness = Harness::new(config()).unwrap().with_sink(sink.clone());
    match harness.measure(&[0x90], 1) {
        Err(e) if e.is_environmental() => return,
        result => {
            result.unwrap();
        }
    }
    let links = sink.links.lock().unwrap().clone();
    let arena: Vec<_> = links.iter().filter(|l| l.contains("bhive_arena")).collect();
    assert!(!arena.is_empty(), "{:?}", links);
    for link in arena {
        assert!(link.starts_with("/memfd:"), "{}", link);
    }
    assert_reaped(&sink.recording);
}
