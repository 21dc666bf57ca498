/// Immediately terminate the calling process without running atexit
/// callbacks, destructors or any other cleanup.
pub fn exit_now(code: u8) -> ! {
    // SAFETY: exiting is safe, the ffi is not safe
    unsafe { nix::libc::_exit(code as _) };
}
