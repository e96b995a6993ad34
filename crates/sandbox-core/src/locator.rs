use chrono::{Days, NaiveDate};

/// One prefix per calendar day in `[start, end)`, chronological ascending.
/// The remote layout shards by hour beneath the day component, so listing a
/// day prefix covers every hour partition of that day. `end <= start` is an
/// empty range; the fatal inverted-range check belongs to request
/// validation, not here.
pub fn day_prefixes(
    pilot: &str,
    message_type: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Vec<String> {
    let mut prefixes = Vec::new();
    let mut current = start;
    while current < end {
        prefixes.push(day_prefix(pilot, message_type, current));
        current = match current.checked_add_days(Days::new(1)) {
            Some(next) => next,
            None => break,
        };
    }
    prefixes
}

/// Key prefix for one day partition: `{pilot}/{MESSAGE_TYPE}/{Y}/{m}/{d}/`.
pub fn day_prefix(pilot: &str, message_type: &str, date: NaiveDate) -> String {
    format!(
        "{}/{}/{}/",
        pilot,
        message_type.to_uppercase(),
        date.format("%Y/%m/%d")
    )
}
