//! Abort failure policy
//!
//! Under `TWINBUF_FAILURE_POLICY=abort` a device failure terminates the
//! process, so the failing half runs in a child copy of this test binary.

use std::env;
use std::process::Command;
use std::sync::Arc;
use twinbuf_core::{DeviceConfig, EmulatedDevice, ManagedBuffer};

const CHILD_MARKER: &str = "TWINBUF_ABORT_TEST_CHILD";

/// Re-run one test of this binary in a child with the abort policy.
fn run_in_aborting_child(test_name: &str) -> std::process::Output {
    Command::new(env::current_exe().unwrap())
        .args(["--exact", test_name, "--test-threads=1", "--nocapture"])
        .env(CHILD_MARKER, "1")
        .env("TWINBUF_FAILURE_POLICY", "abort")
        .output()
        .unwrap()
}

fn assert_abnormal_exit(output: &std::process::Output) {
    assert!(
        !output.status.success(),
        "child exited cleanly: {}",
        String::from_utf8_lossy(&output.stdout)
    );

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(output.status.code(), None, "child should die by signal, got {:?}", output.status);
        assert!(output.status.signal().is_some());
    }
}

#[test]
fn test_allocation_failure_aborts_process() {
    if env::var_os(CHILD_MARKER).is_some() {
        let device = Arc::new(
            EmulatedDevice::new(DeviceConfig::default().with_memory_limit(1024).with_compute_threads(1)).unwrap(),
        );
        // Returning at all, with or without an error, means the policy was ignored.
        let _ = ManagedBuffer::<u8>::new_on(device, 4096);
        return;
    }

    let output = run_in_aborting_child("test_allocation_failure_aborts_process");
    assert_abnormal_exit(&output);
}

#[test]
fn test_kernel_fault_aborts_process() {
    if env::var_os(CHILD_MARKER).is_some() {
        let device = Arc::new(EmulatedDevice::new(DeviceConfig::default().with_compute_threads(1)).unwrap());
        let buf = ManagedBuffer::<u32>::new_on(device, 64).unwrap();
        let _ = buf.device_map(|x| if x == 0 { panic!("fault") } else { x });
        return;
    }

    let output = run_in_aborting_child("test_kernel_fault_aborts_process");
    assert_abnormal_exit(&output);
}
