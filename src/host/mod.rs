//! The host the pipeline runs inside: scene, main loop and shared state.

mod main_loop;
mod state;

pub use main_loop::{MainLoop, MainLoopHandle, Task};
pub(crate) use main_loop::panic_message;
pub use state::{ExportGuard, SharedState, StateSnapshot, UserInfo};

use crate::scene::Scene;
use std::sync::Arc;
use std::time::Duration;

/// Delay before ephemeral data is reclaimed after a run returns.
pub const RECLAIM_DELAY: Duration = Duration::from_millis(100);

/// Delay before the user's selection is restored; always after reclamation.
pub const SELECTION_RESTORE_DELAY: Duration = Duration::from_millis(200);

/// Status line lifetime after a successful run.
pub const STATUS_CLEAR_SUCCESS: Duration = Duration::from_secs(3);

/// Status line lifetime after a failed run.
pub const STATUS_CLEAR_FAILURE: Duration = Duration::from_secs(5);

/// Scene, main loop and shared state bundled together.
pub struct Host {
    pub scene: Scene,
    pub main_loop: MainLoop,
    pub state: Arc<SharedState>,
}

impl Host {
    pub fn new(scene: Scene) -> Self {
        Self {
            scene,
            main_loop: MainLoop::new(),
            state: SharedState::new(),
        }
    }

    /// Let the main loop run until every scheduled task has fired.
    pub fn run_until_idle(&mut self) -> usize {
        self.main_loop.run_until_idle(&mut self.scene)
    }

    pub fn advance(&mut self, dt: Duration) -> usize {
        self.main_loop.advance(&mut self.scene, dt)
    }
}
