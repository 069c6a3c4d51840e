// Copyright 2025 permafrost Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use permafrost_common::error::{Error, Result};

#[derive(Debug, Default)]
struct State {
    deactivating: bool,
    deactivated: bool,
    guard_count: usize,
}

/// The drain barrier between in-flight operations and evictor teardown.
///
/// One instance per evictor, a plain monitor. Every in-flight operation holds a [`Guard`];
/// teardown first fences out new guards, then waits for the count to drain to zero.
#[derive(Debug, Default)]
pub struct DeactivateController {
    state: Mutex<State>,
    cond: Condvar,
}

impl DeactivateController {
    /// Create a controller.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request deactivation.
    ///
    /// Returns true to exactly one caller, the thread responsible for performing the teardown.
    /// Never blocks.
    pub fn deactivate(&self) -> bool {
        let mut state = self.state.lock();
        if state.deactivating {
            return false;
        }
        state.deactivating = true;
        tracing::debug!("[deactivate controller]: deactivating");
        true
    }

    /// Mark the teardown as finished and wake everything still waiting.
    pub fn deactivation_complete(&self) {
        let mut state = self.state.lock();
        state.deactivated = true;
        tracing::debug!("[deactivate controller]: deactivated");
        self.cond.notify_all();
    }

    /// Whether the teardown has finished.
    pub fn is_deactivated(&self) -> bool {
        self.state.lock().deactivated
    }

    /// Block until every outstanding guard is released.
    ///
    /// Only meaningful after [`deactivate`] returned true: new guards are fenced out, so the
    /// count can only drain.
    ///
    /// [`deactivate`]: DeactivateController::deactivate
    pub fn wait_drained(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.deactivating);
        while state.guard_count > 0 {
            self.cond.wait(&mut state);
        }
    }

    /// Block until the teardown thread has finished.
    pub fn wait_deactivated(&self) {
        let mut state = self.state.lock();
        while !state.deactivated {
            self.cond.wait(&mut state);
        }
    }

    #[cfg(test)]
    fn guard_count(&self) -> usize {
        self.state.lock().guard_count
    }
}

/// A scoped reference to the controller, held for the duration of one in-flight operation.
///
/// Construction fails fast once deactivation has begun; it never waits.
#[derive(Debug)]
pub struct Guard {
    controller: Arc<DeactivateController>,
}

impl Guard {
    /// Acquire a guard.
    ///
    /// Fails immediately with [`ErrorKind::Deactivated`] if deactivation has begun or finished;
    /// no state is changed in that case.
    ///
    /// [`ErrorKind::Deactivated`]: permafrost_common::error::ErrorKind::Deactivated
    pub fn new(controller: &Arc<DeactivateController>) -> Result<Self> {
        let mut state = controller.state.lock();
        if state.deactivating || state.deactivated {
            return Err(Error::deactivated());
        }
        state.guard_count += 1;
        drop(state);
        Ok(Self {
            controller: controller.clone(),
        })
    }

    /// The controller this guard counts against.
    pub fn controller(&self) -> &Arc<DeactivateController> {
        &self.controller
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        let mut state = self.controller.state.lock();
        state.guard_count -= 1;
        if state.guard_count == 0 && state.deactivating {
            self.controller.cond.notify_all();
        }
    }
}
