//! A named, session-scoped set of filters.

use crate::event::Event;
use crate::filter::{self, Filter};

#[derive(Clone, Debug)]
pub struct Subscription {
    pub id: String,
    pub filters: Vec<Filter>,
}

impl Subscription {
    pub fn new(id: String, filters: Vec<Filter>) -> Self {
        Subscription { id, filters }
    }

    /// True when any filter matches; the filter list is a disjunction.
    pub fn matches(&self, event: &Event) -> bool {
        filter::matches_any(event, &self.filters)
    }
}
