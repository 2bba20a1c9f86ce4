use chrono::{DateTime, Utc};

/// The fixed IMF-fixdate layout used by `Last-Modified` and friends
/// (RFC 7231, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`).
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

pub fn format_http_date(time: DateTime<Utc>) -> String {
    time.format(HTTP_DATE_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_formats_rfc7231_reference_date() {
        let time = Utc.with_ymd_and_hms(1994, 11, 6, 8, 49, 37).unwrap();
        assert_eq!(format_http_date(time), "Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[test]
    fn test_pads_single_digit_days() {
        let time = Utc.with_ymd_and_hms(2024, 2, 9, 23, 59, 59).unwrap();
        assert_eq!(format_http_date(time), "Fri, 09 Feb 2024 23:59:59 GMT");
    }
}
