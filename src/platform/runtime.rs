use std::future::Future;
use std::time::Duration;

/// Spawns `future` in the background.
#[cfg(target_arch = "wasm32")]
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + 'static,
{
    wasm_bindgen_futures::spawn_local(future);
}

/// Spawns `future` in the background.
///
/// Uses the ambient tokio runtime when there is one; otherwise falls back to a
/// process-wide runtime driven by its own thread.
#[cfg(not(target_arch = "wasm32"))]
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    use tokio::runtime::Handle;

    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => match background_handle() {
            Some(handle) => {
                handle.spawn(future);
            }
            None => log::error!("No async runtime available; dropping background task"),
        },
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn background_handle() -> Option<&'static tokio::runtime::Handle> {
    use std::sync::LazyLock;
    use tokio::runtime::{Builder, Handle};

    static BACKGROUND: LazyLock<Option<Handle>> = LazyLock::new(|| {
        let runtime = match Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(err) => {
                log::error!("Failed to build background runtime: {err}");
                return None;
            }
        };
        let handle = runtime.handle().clone();
        let spawned = std::thread::Builder::new()
            .name("docsync-runtime".into())
            .spawn(move || runtime.block_on(std::future::pending::<()>()));
        match spawned {
            Ok(_) => Some(handle),
            Err(err) => {
                log::error!("Failed to start background runtime thread: {err}");
                None
            }
        }
    });

    BACKGROUND.as_ref()
}

/// Waits for `duration`; returns immediately for a zero duration.
pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }

    sleep_impl(duration).await;
}

#[cfg(target_arch = "wasm32")]
async fn sleep_impl(duration: Duration) {
    gloo_timers::future::sleep(duration).await;
}

#[cfg(not(target_arch = "wasm32"))]
async fn sleep_impl(duration: Duration) {
    tokio::time::sleep(duration).await;
}
