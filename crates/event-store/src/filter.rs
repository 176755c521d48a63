//! Pure stream filtering and cursoring over an in-memory event slice.
//!
//! This is the canonical cursor implementation for backends without native
//! cursoring: filter, sort by `(timestamp, event_id)`, resolve the cursor,
//! truncate to the page limit.

use common::AggregateId;

use crate::event::Event;
use crate::store::{CursorPage, StreamOptions};

/// Applies `options` to an event slice and returns one cursor page.
///
/// An `after` id that is not present in the input degrades to an id-only
/// comparison: sortable ids make `event_id > after` equivalent to resuming
/// after the missing event's position.
pub fn filter_stream<ID: AggregateId>(
    events: Vec<Event<ID>>,
    options: &StreamOptions,
) -> CursorPage<ID> {
    let mut events: Vec<Event<ID>> = events
        .into_iter()
        .filter(|e| matches_filters(e, options))
        .collect();

    events.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.event_id.cmp(&b.event_id))
    });

    if let Some(after) = &options.after {
        match events.iter().position(|e| &e.event_id == after) {
            Some(index) => {
                events.drain(..=index);
            }
            None => {
                events.retain(|e| &e.event_id > after);
            }
        }
    }

    let limit = options.effective_limit();
    let has_more = events.len() > limit;
    events.truncate(limit);

    let next_cursor = events.last().map(|e| e.event_id.clone());
    CursorPage {
        events,
        next_cursor,
        has_more,
    }
}

fn matches_filters<ID: AggregateId>(event: &Event<ID>, options: &StreamOptions) -> bool {
    if !options.event_types.is_empty() && !options.event_types.contains(&event.event_type) {
        return false;
    }
    if !options.aggregate_types.is_empty()
        && !options.aggregate_types.contains(&event.aggregate_type)
    {
        return false;
    }
    if let Some(from) = options.from_time
        && event.timestamp < from
    {
        return false;
    }
    if let Some(to) = options.to_time
        && event.timestamp > to
    {
        return false;
    }
    true
}
