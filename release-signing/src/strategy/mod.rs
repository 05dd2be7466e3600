// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Signing strategies.

Every [Strategy] is implemented by a module exposing an async `sign`
function. Strategies operate on a file in place and return the paths they
produced, primary output first. Container strategies sign archive members
concurrently through [join_fail_fast].
*/

pub mod authenticode;
pub mod detached;
pub mod file;
pub mod macapp;
pub mod mar;
pub mod omnija;
pub mod widevine;
pub mod xpi;

use {
    crate::{
        context::SigningContext,
        error::Result,
        format::{SigningFormat, Strategy},
    },
    futures::{Future, StreamExt},
    log::debug,
    std::{
        path::{Path, PathBuf},
        sync::atomic::{AtomicBool, Ordering},
    },
};

/// Sign `path` with the given strategy.
pub async fn apply(
    context: &SigningContext,
    strategy: Strategy,
    path: &Path,
    format: &SigningFormat,
    comment: Option<&str>,
) -> Result<Vec<PathBuf>> {
    debug!("signing {} with {:?} strategy", path.display(), strategy);

    match strategy {
        Strategy::File => file::sign(context, path, format).await,
        Strategy::Detached => detached::sign_rsa(context, path, format).await,
        Strategy::Gpg => detached::sign_gpg(context, path, format).await,
        Strategy::Widevine => widevine::sign(context, path, format).await,
        Strategy::Omnija => omnija::sign(context, path, format).await,
        Strategy::Mar => mar::sign(context, path, format).await,
        Strategy::Authenticode => authenticode::sign(context, path, format, comment).await,
        Strategy::Xpi => xpi::sign(context, path, format).await,
        Strategy::MacApp => macapp::sign(context, path, format).await,
    }
}

/// Run `f` over `items` with at most `limit` calls in flight.
///
/// Once a call fails, items that have not started are skipped. Calls
/// already in flight are driven to completion and the first error in
/// completion order is returned. Results of successful calls are returned
/// in completion order.
pub async fn join_fail_fast<T, R, F, Fut>(items: Vec<T>, limit: usize, f: F) -> Result<Vec<R>>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let abort = AtomicBool::new(false);
    let abort = &abort;
    let f = &f;

    let mut stream = futures::stream::iter(items.into_iter().map(|item| async move {
        if abort.load(Ordering::SeqCst) {
            return None;
        }

        let res = f(item).await;
        if res.is_err() {
            abort.store(true, Ordering::SeqCst);
        }
        Some(res)
    }))
    .buffer_unordered(limit.max(1));

    let mut results = vec![];
    let mut first_error = None;

    while let Some(res) = stream.next().await {
        match res {
            Some(Ok(value)) => results.push(value),
            Some(Err(e)) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
            None => {}
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(results),
    }
}
