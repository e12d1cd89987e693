use crate::checkin::LogEntry;

/// Per-user running state. Only the aggregation side writes it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserAggregate {
    /// Timestamp of the most recent processed check-in; never moves backwards.
    pub last_checkin: Option<u64>,
    /// Location of that check-in.
    pub last_seen_at: Option<u64>,
    pub num_checkins: u64,
}

/// Per-location running state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocationAggregate {
    pub num_checkins: u64,
    pub num_stars: u64,
    /// Always `average_stars(num_stars, num_checkins)`.
    pub average_stars: u64,
}

/// Rounded mean rating, halves rounding up.
pub fn average_stars(num_stars: u64, num_checkins: u64) -> u64 {
    if num_checkins == 0 {
        return 0;
    }
    (2 * num_stars + num_checkins) / (2 * num_checkins)
}

/// What a commit did with an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The aggregates were updated and the entry's bookkeeping (ack or checkpoint) recorded.
    Applied(CommitReport),
    /// The entry had already been recorded as processed; nothing was touched.
    AlreadyProcessed,
}

/// Post-commit values, read atomically with the increments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitReport {
    /// Whether `last_checkin`/`last_seen_at` moved to this entry.
    pub recency_updated: bool,
    pub user_checkins: u64,
    pub location: LocationAggregate,
}

/// Applies one entry to the aggregates in place. This is the reference for the
/// store-side script: recency only moves forward, counters always increment,
/// and the average is recomputed from the incremented values.
pub fn apply_entry(
    entry: &LogEntry,
    user: &mut UserAggregate,
    location: &mut LocationAggregate,
) -> CommitReport {
    let timestamp = entry.timestamp();
    let recency_updated = user.last_checkin.map_or(true, |last| timestamp > last);
    if recency_updated {
        user.last_checkin = Some(timestamp);
        user.last_seen_at = Some(entry.checkin.location_id);
    }

    user.num_checkins += 1;
    location.num_checkins += 1;
    location.num_stars += u64::from(entry.checkin.star_rating);
    location.average_stars = average_stars(location.num_stars, location.num_checkins);

    CommitReport {
        recency_updated,
        user_checkins: user.num_checkins,
        location: *location,
    }
}
