//! Accumulation and grouping of view events between flushes.

use std::collections::BTreeMap;

use chrono::NaiveDate;

use super::queue::ViewEvent;
use crate::content::ContentId;

/// Events accepted since the last flush.
#[derive(Debug)]
pub struct Batch {
    events: Vec<ViewEvent>,
    limit: usize,
}

impl Batch {
    /// Creates an empty batch that reports full at `limit` events.
    pub fn with_limit(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            events: Vec::with_capacity(limit),
            limit,
        }
    }

    pub fn push(&mut self, event: ViewEvent) {
        self.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.events.len() >= self.limit
    }

    /// Hands out the accumulated events and leaves the batch empty.
    pub fn take(&mut self) -> Vec<ViewEvent> {
        std::mem::replace(&mut self.events, Vec::with_capacity(self.limit))
    }
}

/// View counts grouped for storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Aggregate {
    /// Total views per content id across all days.
    pub totals: BTreeMap<ContentId, u64>,
    /// Views per content id and calendar day.
    pub daily: BTreeMap<(ContentId, NaiveDate), u64>,
}

impl Aggregate {
    /// Groups `events` by content id and calendar day.
    pub fn from_events(events: &[ViewEvent]) -> Self {
        let mut aggregate = Self::default();
        for event in events {
            *aggregate.totals.entry(event.content_id).or_insert(0) += 1;
            *aggregate
                .daily
                .entry((event.content_id, event.day()))
                .or_insert(0) += 1;
        }
        aggregate
    }

    /// Per-day counts for one content id, oldest day first.
    pub fn days_for(&self, id: ContentId) -> impl Iterator<Item = (NaiveDate, u64)> + '_ {
        self.daily
            .range((id, NaiveDate::MIN)..=(id, NaiveDate::MAX))
            .map(|(&(_, day), &count)| (day, count))
    }

    pub fn event_count(&self) -> u64 {
        self.totals.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn view(id: u64, day: u32, hour: u32) -> ViewEvent {
        ViewEvent {
            content_id: ContentId(id),
            observed_at: Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap(),
        }
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    #[test]
    fn batch_reports_full_at_limit() {
        let mut batch = Batch::with_limit(2);
        batch.push(view(1, 1, 0));
        assert!(!batch.is_full());
        batch.push(view(1, 1, 1));
        assert!(batch.is_full());

        let taken = batch.take();
        assert_eq!(taken.len(), 2);
        assert!(batch.is_empty());
        assert!(!batch.is_full());
    }

    #[test]
    fn groups_by_content_and_day() {
        let events = vec![
            view(1, 1, 8),
            view(1, 1, 9),
            view(1, 1, 23),
            view(1, 2, 0),
            view(1, 2, 12),
            view(2, 2, 12),
        ];
        let aggregate = Aggregate::from_events(&events);

        assert_eq!(aggregate.totals[&ContentId(1)], 5);
        assert_eq!(aggregate.totals[&ContentId(2)], 1);
        assert_eq!(aggregate.daily[&(ContentId(1), date(1))], 3);
        assert_eq!(aggregate.daily[&(ContentId(1), date(2))], 2);
        assert_eq!(aggregate.event_count(), 6);

        let days: Vec<_> = aggregate.days_for(ContentId(1)).collect();
        assert_eq!(days, vec![(date(1), 3), (date(2), 2)]);
        let days: Vec<_> = aggregate.days_for(ContentId(2)).collect();
        assert_eq!(days, vec![(date(2), 1)]);
        assert_eq!(aggregate.days_for(ContentId(3)).count(), 0);
    }

    #[test]
    fn empty_input_is_empty_aggregate() {
        assert_eq!(Aggregate::from_events(&[]), Aggregate::default());
    }
}
