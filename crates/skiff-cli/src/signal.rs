use std::sync::OnceLock;

use skiff_core::cancel::CancelFlag;

static CANCEL: OnceLock<CancelFlag> = OnceLock::new();

/// Install signal handlers for cooperative shutdown.
///
/// The first SIGINT/SIGTERM sets the cancel flag and restores the default
/// handler, so a second signal terminates immediately.
pub fn install(flag: CancelFlag) {
    let _ = CANCEL.set(flag);

    #[cfg(unix)]
    {
        // Safety: the handler only stores an atomic bool and restores the
        // default disposition.
        unsafe {
            libc::signal(
                libc::SIGINT,
                unix_signal_handler as *const () as libc::sighandler_t,
            );
            libc::signal(
                libc::SIGTERM,
                unix_signal_handler as *const () as libc::sighandler_t,
            );
        }
    }
}

#[cfg(unix)]
extern "C" fn unix_signal_handler(sig: libc::c_int) {
    if let Some(flag) = CANCEL.get() {
        flag.cancel();
    }
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
    }
}
