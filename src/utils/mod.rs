//! Small shared helpers that don't belong to any one subsystem.

pub mod clock;
pub mod dashmap;

/// Format a `chrono::Duration` the way the reference pooler formats
/// connection ages/idle times in its log lines.
pub fn format_duration(duration: &chrono::Duration) -> String {
    let milliseconds = format!("{:0>3}", duration.num_milliseconds() % 1000);
    let seconds = format!("{:0>2}", duration.num_seconds() % 60);
    let minutes = format!("{:0>2}", duration.num_minutes() % 60);
    let hours = format!("{:0>2}", duration.num_hours() % 24);
    let days = duration.num_days().to_string();
    format!("{days}d {hours}:{minutes}:{seconds}.{milliseconds}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_sub_day_duration() {
        let d = chrono::Duration::seconds(3725);
        assert_eq!(format_duration(&d), "0d 01:02:05.000");
    }
}
