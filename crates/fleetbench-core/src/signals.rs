//! Signal discipline: fault diagnostics with a best-effort backtrace,
//! cooperative SIGINT/SIGTERM interruption for the master, and per-thread
//! masking so only the main thread ever receives an interrupt.

use std::backtrace::Backtrace;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use crate::run_state;

const BACKTRACE_FILE_NAME: &str = "fleetbench_fault_trace.txt";

/// Where fault backtraces are appended. World-readable so traces from
/// different users on a shared system can be collected.
pub fn fault_trace_path() -> PathBuf {
    std::env::temp_dir().join(BACKTRACE_FILE_NAME)
}

fn handler_addr(handler: extern "C" fn(libc::c_int)) -> libc::sighandler_t {
    handler as libc::sighandler_t
}

/// Register handlers for SIGSEGV and friends. Called once at startup, in
/// both master and service mode.
pub fn register_fault_handlers() {
    let addr = handler_addr(fault_signal_handler);
    unsafe {
        libc::signal(libc::SIGSEGV, addr);
        libc::signal(libc::SIGFPE, addr);
        libc::signal(libc::SIGBUS, addr);
        libc::signal(libc::SIGILL, addr);
        libc::signal(libc::SIGABRT, addr);
    }
}

/// Register SIGINT/SIGTERM handlers that ask workers to self-terminate via
/// the shared interrupt flag. Master mode only; a service just dies on an
/// interrupt signal.
pub fn register_interrupt_handlers() {
    let addr = handler_addr(interrupt_signal_handler);
    unsafe {
        libc::signal(libc::SIGINT, addr);
        libc::signal(libc::SIGTERM, addr);
    }
}

/// Set the cooperative interrupt flag and reset the handler to default, so
/// a second press terminates hard if the friendly way does not work out.
extern "C" fn interrupt_signal_handler(sig: libc::c_int) {
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
    }
    run_state::process_state().set_interrupted();
}

/// Print a diagnostic header plus backtrace to stderr and the trace file,
/// then re-raise with the default handler to terminate.
extern "C" fn fault_signal_handler(sig: libc::c_int) {
    let what = match sig {
        libc::SIGSEGV => "Segmentation fault",
        libc::SIGFPE => "Floating point exception",
        libc::SIGBUS => "Bus error (bad memory access)",
        libc::SIGILL => "Illegal instruction",
        libc::SIGABRT => "Abnormal termination",
        _ => "Received an unknown signal",
    };

    let header = format!(
        "FAULT HANDLER (PID {} / TID {}): {}\n",
        std::process::id(),
        thread_id(),
        what
    );
    eprint!("{}", header);

    let trace = format!(
        "******** BACKTRACE START ********\n{}\n********* BACKTRACE END *********\n",
        Backtrace::force_capture()
    );
    eprint!("{}", trace);

    let path = fault_trace_path();
    if let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(&path) {
        let _ = file.write_all(header.as_bytes());
        let _ = file.write_all(trace.as_bytes());
        let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666));
        eprintln!("Saved backtrace: {}", path.display());
    }

    // reset and re-raise so the process dies with the real signal status
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
    }
}

/// Block SIGINT/SIGTERM for the calling thread. Linux may deliver a
/// process-directed signal to any thread that does not block it, so every
/// worker thread calls this first; the mask is inherited by threads it
/// spawns in turn.
pub fn block_interrupt_signals() -> bool {
    unsafe {
        let mut mask: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut mask);
        libc::sigaddset(&mut mask, libc::SIGINT);
        libc::sigaddset(&mut mask, libc::SIGTERM);
        libc::pthread_sigmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut()) == 0
    }
}

/// Undo `block_interrupt_signals` for the calling thread.
pub fn unblock_interrupt_signals() -> bool {
    unsafe {
        let mut mask: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut mask);
        libc::sigaddset(&mut mask, libc::SIGINT);
        libc::sigaddset(&mut mask, libc::SIGTERM);
        libc::pthread_sigmask(libc::SIG_UNBLOCK, &mask, std::ptr::null_mut()) == 0
    }
}

/// Linux thread ID (not the POSIX thread handle), to show which thread hit
/// a fault.
fn thread_id() -> i64 {
    unsafe { libc::syscall(libc::SYS_gettid) as i64 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_and_unblock_succeed() {
        assert!(block_interrupt_signals());
        assert!(unblock_interrupt_signals());
    }

    #[test]
    fn trace_path_is_under_tmp() {
        let path = fault_trace_path();
        assert!(path.ends_with(BACKTRACE_FILE_NAME));
    }
}
