// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Read-side derivations over the receipt ledger."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Implements the derivation operations of spec §4.5. None of these mutate
//! the ledger; they exist to answer questions a caller could in principle
//! answer by scanning every receipt themselves, just faster.

use receiptgate_core::Receipt;
use receiptgate_error::{ErrorKind, ReceiptGateError};
use receiptgate_store::{PageCursor, SearchFilter, Store};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub use receiptgate_store::PageCursor as ReceiptsPageCursor;
pub use receiptgate_store::SearchFilter as SearchReceiptsFilter;

/// Default page size for list operations absent an explicit `limit`.
pub const DEFAULT_LIMIT: i64 = 50;
/// Hard ceiling on any single page, regardless of requested `limit`.
pub const MAX_LIMIT: i64 = 500;

/// One page of receipts plus the cursor to pass back for the next page, if
/// any rows remain beyond this page (spec §4.5 pagination).
#[derive(Debug, Clone)]
pub struct Page<T> {
    /// The rows for this page.
    pub items: Vec<T>,
    /// Present when more rows exist beyond this page.
    pub next_cursor: Option<PageCursor>,
}

/// Which direction to walk an obligation's receipt chain from a starting
/// receipt (spec §4.5 `get_receipt_chain`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Walk toward the root via `caused_by_receipt_id`.
    Ancestors,
    /// Walk toward the leaves via receipts that name this one as parent.
    Descendants,
    /// Walk both directions and merge the results.
    Both,
}

/// A receipt visited while walking a chain, paired with how many hops it
/// sits from the requested starting receipt (spec §4.5 `get_receipt_chain`:
/// "callers need to tell how far a given receipt is from the one they
/// asked about, not just that it's somewhere in the chain").
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ChainEntry {
    /// The receipt at this position in the chain.
    pub receipt: Receipt,
    /// Hops from the starting receipt: `0` for the starting receipt itself,
    /// `1` for its immediate parent/child, and so on.
    pub depth: u32,
}

/// Default walk depth (spec §4.5): generous for normal obligations without
/// letting a single call scan the whole table.
pub const DEFAULT_MAX_DEPTH: u32 = 64;
/// Absolute ceiling on `max_depth`, regardless of what a caller requests.
pub const HARD_MAX_DEPTH: u32 = 1024;

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

/// Fetch `limit + 1` rows and split off the overflow row as the signal that
/// another page exists, building `next_cursor` from the last row actually
/// kept.
fn paginate(mut rows: Vec<Receipt>, limit: i64) -> Page<Receipt> {
    let has_more = rows.len() as i64 > limit;
    if has_more {
        rows.truncate(limit as usize);
    }
    let next_cursor = if has_more {
        rows.last().and_then(|r| {
            r.created_at.map(|created_at| PageCursor {
                created_at,
                receipt_id: r.receipt_id.as_str().to_string(),
            })
        })
    } else {
        None
    };
    Page { items: rows, next_cursor }
}

/// Return accepted-phase receipts addressed to `recipient_ai`, newest
/// first (spec §4.5 `list_inbox`). "Latest" filters out any receipt that a
/// strictly newer sibling in the same obligation has already superseded.
///
/// # Errors
///
/// Returns [`ErrorKind::Backend`] on a query failure.
pub async fn list_inbox(
    store: &Store,
    recipient_ai: &str,
    limit: Option<i64>,
    cursor: Option<&PageCursor>,
) -> Result<Page<Receipt>, ReceiptGateError> {
    let limit = clamp_limit(limit);
    let rows = store.list_inbox(recipient_ai, limit + 1, cursor).await?;
    Ok(paginate(rows, limit))
}

/// Return a single receipt by its external `receipt_id`.
///
/// # Errors
///
/// Returns [`ErrorKind::NotFound`] if no such receipt exists, or
/// [`ErrorKind::Backend`] on a query failure.
pub async fn get_receipt(store: &Store, receipt_id: &str) -> Result<Receipt, ReceiptGateError> {
    store
        .find_by_receipt_id(receipt_id)
        .await?
        .ok_or_else(|| {
            ReceiptGateError::new(ErrorKind::NotFound, format!("no receipt with receipt_id {receipt_id:?}"))
        })
}

/// Every receipt referencing `task_id`, oldest first.
///
/// # Errors
///
/// Returns [`ErrorKind::Backend`] on a query failure.
pub async fn list_task_receipts(store: &Store, task_id: &str) -> Result<Vec<Receipt>, ReceiptGateError> {
    store.list_task_receipts(task_id).await
}

/// Filtered, paginated search over all receipts (spec §4.5
/// `search_receipts`).
///
/// # Errors
///
/// Returns [`ErrorKind::Backend`] on a query failure.
pub async fn search_receipts(
    store: &Store,
    filter: &SearchFilter,
    limit: Option<i64>,
    cursor: Option<&PageCursor>,
) -> Result<Page<Receipt>, ReceiptGateError> {
    let limit = clamp_limit(limit);
    let rows = store.search_receipts(filter, limit + 1, cursor).await?;
    Ok(paginate(rows, limit))
}

/// Walk an obligation's receipt chain from `receipt_id` in the requested
/// [`Direction`], stopping at `max_depth` hops (default
/// [`DEFAULT_MAX_DEPTH`], hard-capped at [`HARD_MAX_DEPTH`]). Each returned
/// [`ChainEntry`] records how many hops its receipt sits from the starting
/// receipt.
///
/// A `HashSet` of visited `receipt_id`s guards against cycles a corrupt or
/// adversarial dataset might otherwise trap the walk in; the chain is
/// expected to be acyclic by construction (every edge points strictly
/// backward in time), but the walker does not trust that.
///
/// # Errors
///
/// Returns [`ErrorKind::NotFound`] if the starting receipt does not exist,
/// or [`ErrorKind::Backend`] on a query failure.
pub async fn get_receipt_chain(
    store: &Store,
    receipt_id: &str,
    direction: Direction,
    max_depth: Option<u32>,
) -> Result<Vec<ChainEntry>, ReceiptGateError> {
    let max_depth = max_depth.unwrap_or(DEFAULT_MAX_DEPTH).min(HARD_MAX_DEPTH);
    let start = get_receipt(store, receipt_id).await?;

    let mut seen: HashSet<String> = HashSet::new();
    seen.insert(start.receipt_id.as_str().to_string());
    let mut chain = vec![ChainEntry { receipt: start.clone(), depth: 0 }];

    if matches!(direction, Direction::Ancestors | Direction::Both) {
        let ancestors = walk_ancestors(store, &start, max_depth, &mut seen).await?;
        chain.extend(ancestors);
    }

    if matches!(direction, Direction::Descendants | Direction::Both) {
        let descendants = walk_descendants(store, &start, max_depth, &mut seen).await?;
        chain.extend(descendants);
    }

    Ok(chain)
}

async fn walk_ancestors(
    store: &Store,
    start: &Receipt,
    max_depth: u32,
    seen: &mut HashSet<String>,
) -> Result<Vec<ChainEntry>, ReceiptGateError> {
    let mut out = Vec::new();
    let mut current = start.clone();
    for depth in 1..=max_depth {
        let Some(parent) = store.find_parent(&current).await? else {
            break;
        };
        if !seen.insert(parent.receipt_id.as_str().to_string()) {
            break;
        }
        out.push(ChainEntry { receipt: parent.clone(), depth });
        current = parent;
    }
    Ok(out)
}

async fn walk_descendants(
    store: &Store,
    start: &Receipt,
    max_depth: u32,
    seen: &mut HashSet<String>,
) -> Result<Vec<ChainEntry>, ReceiptGateError> {
    let mut out = Vec::new();
    let mut frontier = vec![start.clone()];
    for depth in 1..=max_depth {
        if frontier.is_empty() {
            break;
        }
        let mut next_frontier = Vec::new();
        for receipt in &frontier {
            for child in store.find_children(receipt).await? {
                if seen.insert(child.receipt_id.as_str().to_string()) {
                    out.push(ChainEntry { receipt: child.clone(), depth });
                    next_frontier.push(child);
                }
            }
        }
        frontier = next_frontier;
    }
    Ok(out)
}
