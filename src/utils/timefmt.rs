use crate::pipeline::types::Timestamp;

/// `mm:ss / mm:ss`, or `h:mm:ss / h:mm:ss` once the duration reaches an hour.
///
/// With an unknown (zero) duration only the position is printed.
pub fn describe_seek(position: Timestamp, duration: Timestamp) -> String {
    let hours = duration.micros >= 3_600_000_000;
    if duration.micros <= 0 {
        return format_time(position, position.micros >= 3_600_000_000);
    }
    format!(
        "{} / {}",
        format_time(position, hours),
        format_time(duration, hours)
    )
}

fn format_time(time: Timestamp, hours: bool) -> String {
    let total = time.micros.max(0) / 1_000_000;
    let (h, m, s) = (total / 3600, (total / 60) % 60, total % 60);
    if hours {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", total / 60, s)
    }
}
