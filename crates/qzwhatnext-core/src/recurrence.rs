use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rrule::{RRuleSet, Tz as RRuleTz};

use crate::error::EngineError;

/// Upper bound on expanded occurrences per rule evaluation.
const OCCURRENCE_LIMIT: u16 = 1000;

/// A validated, timezone-anchored recurrence rule.
///
/// Responsibilities:
/// 1. Parse and validate RRULE strings in context of the owner's timezone
/// 2. Generate occurrence sequences between arbitrary time ranges
/// 3. Compute habit windows: an occurrence's window runs until the next
///    occurrence starts
#[derive(Debug, Clone)]
pub struct RecurrenceRule {
    rrule_set: RRuleSet,
}

impl RecurrenceRule {
    /// Parses a stored canonical rule (one that already carries DTSTART).
    pub fn parse(rrule: &str) -> Result<Self, EngineError> {
        let rrule_set = rrule
            .parse::<RRuleSet>()
            .map_err(|e| EngineError::InvalidRecurrence(format!("{rrule}: {e}")))?;
        Ok(Self { rrule_set })
    }

    /// Validates an RRULE string in the context of a timezone.
    pub fn validate(rrule: &str, timezone: &str) -> Result<(), EngineError> {
        crate::timezone::validate_timezone(timezone)?;

        let rrule_string = if !rrule.contains("DTSTART") {
            format!(
                "DTSTART:{}\nRRULE:{}",
                Utc::now().format("%Y%m%dT%H%M%SZ"),
                rrule
            )
        } else {
            rrule.to_string()
        };

        rrule_string
            .parse::<RRuleSet>()
            .map(|_| ())
            .map_err(|e| EngineError::InvalidRecurrence(format!("{rrule}: {e}")))
    }

    /// Normalizes a raw rule to canonical format with explicit DTSTART and
    /// TZID, the storage format for every series and time block.
    pub fn normalize(
        rrule: &str,
        dtstart: DateTime<Utc>,
        timezone: &str,
    ) -> Result<String, EngineError> {
        Self::validate(rrule, timezone)?;

        let tz: Tz = crate::timezone::validate_timezone(timezone)?;
        let dtstart_local = dtstart.with_timezone(&tz);

        let normalized = format!(
            "DTSTART;TZID={}:{}\nRRULE:{}",
            timezone,
            dtstart_local.format("%Y%m%dT%H%M%S"),
            rrule
        );

        // The normalized form must itself parse.
        normalized
            .parse::<RRuleSet>()
            .map_err(|e| EngineError::InvalidRecurrence(format!("{normalized}: {e}")))?;

        Ok(normalized)
    }

    /// Occurrences with `start <= occurrence < end`, ascending. Bounds are
    /// padded by a second and re-filtered so the half-open contract holds
    /// regardless of the rule set's own bound inclusivity.
    pub fn occurrences_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<DateTime<Utc>> {
        let pad = chrono::Duration::seconds(1);
        let bounded = self
            .rrule_set
            .clone()
            .after((start - pad).with_timezone(&RRuleTz::UTC))
            .before((end + pad).with_timezone(&RRuleTz::UTC));

        let (occurrences, _) = bounded.all(OCCURRENCE_LIMIT);
        occurrences
            .into_iter()
            .map(|dt| dt.with_timezone(&Utc))
            .filter(|dt| *dt >= start && *dt < end)
            .collect()
    }

    /// First occurrence strictly after the given instant, or None when the
    /// series has ended.
    pub fn next_occurrence_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let bounded = self
            .rrule_set
            .clone()
            .after(after.with_timezone(&RRuleTz::UTC));

        let (occurrences, _) = bounded.all(10);
        occurrences
            .into_iter()
            .map(|dt| dt.with_timezone(&Utc))
            .find(|dt| *dt > after)
    }

    /// Latest occurrence at or before the given instant. This is the
    /// occurrence whose habit window may still be open.
    pub fn current_occurrence_at(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let pad = chrono::Duration::seconds(1);
        let bounded = self
            .rrule_set
            .clone()
            .before((at + pad).with_timezone(&RRuleTz::UTC));

        let (occurrences, _) = bounded.all(OCCURRENCE_LIMIT);
        occurrences
            .into_iter()
            .map(|dt| dt.with_timezone(&Utc))
            .filter(|dt| *dt <= at)
            .last()
    }

    /// End of the habit window for an occurrence: the start of the next one.
    /// None means the window never closes (series end).
    pub fn window_end(&self, occurrence_start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.next_occurrence_after(occurrence_start)
    }
}

/// Statistics from one materializer pass over a user's series.
#[derive(Debug, Clone, Default)]
pub struct MaterializationSummary {
    pub series_processed: usize,
    pub instances_created: usize,
    pub missed_marked: usize,
}
