//! REST API endpoint modules.
//!
//! Each module exposes its actions as plain async functions over
//! [`AppState`](crate::AppState) so the REST handlers and the dispatch
//! endpoint share one implementation.

pub mod branches;
pub mod dispatch;
pub mod rollback;
pub mod status;
pub mod version;

use axum::http::HeaderMap;

use branchbase_core::batch::CommitBatchRequest;
use branchbase_core::engine::AppendRequest;
use branchbase_core::merge::MergeRequest;
use branchbase_core::rollback::{PointRollbackRequest, RollbackRequest};

use crate::AppState;

/// Header naming the acting author when the body carries no `authorId`.
pub const AUTHOR_HEADER: &str = "x-author-id";

/// A request body with an optional author.
pub trait Authored {
    fn author_mut(&mut self) -> &mut String;
}

macro_rules! authored {
    ($($ty:ty),* $(,)?) => {
        $(impl Authored for $ty {
            fn author_mut(&mut self) -> &mut String {
                &mut self.author_id
            }
        })*
    };
}

authored!(
    MergeRequest,
    RollbackRequest,
    rollback::SelectiveRequest,
    CommitBatchRequest,
    AppendRequest,
    PointRollbackRequest,
);

/// Author for this request: the `X-Author-Id` header, else the configured
/// default.
pub fn request_author(state: &AppState, headers: &HeaderMap) -> String {
    headers
        .get(AUTHOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| state.config.web.default_author.clone())
}

/// Fill a blank `authorId`; an author in the body always wins.
pub fn with_author<T: Authored>(mut request: T, state: &AppState, headers: &HeaderMap) -> T {
    let author = request.author_mut();
    if author.trim().is_empty() {
        *author = request_author(state, headers);
    }
    request
}
