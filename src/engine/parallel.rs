// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{any::Any, thread};

use log::debug;

use crate::harness::errors::{DmTestError, DmTestResult};

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// Run op on every item, each on its own thread, and wait for all of them.
/// Results are returned in item order. If any branch fails, the failure of
/// the earliest such item is returned; a panicking branch counts as a
/// failure.
pub fn in_parallel<I, T, F>(items: Vec<I>, op: F) -> DmTestResult<Vec<T>>
where
    I: Send,
    T: Send,
    F: Fn(I) -> DmTestResult<T> + Sync,
{
    debug!("Running {} branches in parallel", items.len());
    thread::scope(|scope| {
        let op = &op;
        let workers: Vec<_> = items
            .into_iter()
            .map(|item| scope.spawn(move || op(item)))
            .collect();

        let mut results = Vec::with_capacity(workers.len());
        let mut first_err = None;
        for (index, worker) in workers.into_iter().enumerate() {
            match worker.join() {
                Ok(Ok(value)) => results.push(value),
                Ok(Err(err)) => {
                    first_err.get_or_insert(err);
                }
                Err(payload) => {
                    first_err.get_or_insert(DmTestError::Parallel(format!(
                        "branch {}: {}",
                        index,
                        panic_message(payload.as_ref())
                    )));
                }
            }
        }
        first_err.map_or(Ok(results), Err)
    })
}
