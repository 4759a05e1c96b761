//! Global tokio runtime backing the blocking API.
//!
//! Blocking calls such as [`HttpRemote::send_blocking`](crate::HttpRemote::send_blocking)
//! run their future on this runtime. It is created on first use.

use std::sync::OnceLock;

use tokio::runtime::Runtime;

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Initialize the runtime.
///
/// Call this early to control when the worker threads start; otherwise the
/// runtime is created on first use.
pub fn init() -> &'static Runtime {
    RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("horizon-lattice-remote")
            .enable_all()
            .build()
            .expect("Failed to create tokio runtime")
    })
}

/// Get the runtime, creating it if needed.
pub fn get() -> &'static Runtime {
    init()
}

/// Block on a future using the global runtime.
///
/// # Warning
///
/// Do not call this from within an async context; it blocks the current
/// thread and panics inside a tokio runtime.
pub fn block_on<F: std::future::Future>(future: F) -> F::Output {
    get().block_on(future)
}

