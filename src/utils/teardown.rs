// Copyright 2025 jonefeewang@gmail.com
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

use std::fmt::Display;

use tracing::{trace, warn};

use crate::AppResult;

/// Records the outcome of one teardown step.
///
/// A failed step is logged and downgraded to "proceed anyway", so the caller can
/// run the next step unconditionally. Returns whether the step succeeded.
pub fn log_step(owner: impl Display, step: &str, result: AppResult<()>) -> bool {
    match result {
        Ok(()) => {
            trace!("{} teardown step {} done", owner, step);
            true
        }
        Err(err) => {
            warn!("{} teardown step {} failed: {}", owner, step, err);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AppError;

    #[test]
    fn test_failed_step_does_not_stop_sequence() {
        let steps: Vec<(&str, AppResult<()>)> = vec![
            ("shutdown", Err(AppError::IllegalStateError("not connected".into()))),
            ("cancel", Ok(())),
            ("close", Err(AppError::IllegalStateError("already closed".into()))),
            ("release", Ok(())),
        ];
        let outcomes: Vec<bool> = steps
            .into_iter()
            .map(|(step, result)| log_step("session #1", step, result))
            .collect();
        assert_eq!(outcomes, vec![false, true, false, true]);
    }
}
