//! Progress parsing for encoder diagnostic output
//!
//! ffmpeg reports `time=HH:MM:SS.xx` and `speed=N.NNx` on its status line.
//! Each parsed line supersedes the previous one; lines without a usable time
//! token are ignored.

/// Telemetry extracted from one status line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    /// Media time encoded so far, in seconds.
    pub elapsed_secs: f64,
    /// Encode speed relative to realtime, if reported and positive.
    pub speed: Option<f64>,
}

/// Value following `key` up to the next whitespace, skipping padding after `=`.
fn token_after<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let start = line.find(key)? + key.len();
    let rest = line[start..].trim_start();
    let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    let token = &rest[..end];
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// Parse `HH:MM:SS.ms` (hours may exceed 24) into seconds.
pub fn parse_timestamp(value: &str) -> Option<f64> {
    let mut parts = value.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    let total = hours * 3600.0 + minutes * 60.0 + seconds;
    if total.is_finite() && total >= 0.0 && hours >= 0.0 {
        Some(total)
    } else {
        None
    }
}

/// Extract elapsed time and speed from a status line.
pub fn parse_line(line: &str) -> Option<ProgressSample> {
    let time = token_after(line, "out_time=").or_else(|| token_after(line, "time="))?;
    let elapsed_secs = parse_timestamp(time)?;

    let speed = token_after(line, "speed=")
        .and_then(|s| s.trim_end_matches('x').parse::<f64>().ok())
        .filter(|s| s.is_finite() && *s > 0.0);

    Some(ProgressSample {
        elapsed_secs,
        speed,
    })
}

/// Tracks the latest sample of one pass and maps it onto the whole job.
#[derive(Debug, Clone)]
pub struct ProgressParser {
    total_secs: f64,
    pass: u8,
    passes: u8,
    latest: Option<ProgressSample>,
}

impl ProgressParser {
    /// Parser for a single-pass encode of `total_secs` of media.
    pub fn new(total_secs: f64) -> Self {
        Self::for_pass(total_secs, 1, 1)
    }

    /// Parser for `pass` (1-based) of `passes`.
    pub fn for_pass(total_secs: f64, pass: u8, passes: u8) -> Self {
        let passes = passes.max(1);
        Self {
            total_secs,
            pass: pass.clamp(1, passes),
            passes,
            latest: None,
        }
    }

    /// Consume a line. Returns true when it carried a new sample.
    pub fn feed(&mut self, line: &str) -> bool {
        match parse_line(line) {
            Some(sample) => {
                self.latest = Some(sample);
                true
            }
            None => false,
        }
    }

    pub fn latest(&self) -> Option<ProgressSample> {
        self.latest
    }

    /// Percent of the current pass, clamped to [0, 100].
    pub fn percent(&self) -> f64 {
        match self.latest {
            Some(sample) if self.total_secs > 0.0 => {
                (sample.elapsed_secs / self.total_secs * 100.0).clamp(0.0, 100.0)
            }
            _ => 0.0,
        }
    }

    /// Seconds left in the current pass, None without a positive speed.
    pub fn eta_secs(&self) -> Option<f64> {
        let sample = self.latest?;
        let speed = sample.speed?;
        Some((self.total_secs - sample.elapsed_secs).max(0.0) / speed)
    }

    /// Percent of the whole job across all passes.
    pub fn overall_percent(&self) -> f64 {
        let done_passes = (self.pass - 1) as f64;
        ((done_passes + self.percent() / 100.0) / self.passes as f64 * 100.0).clamp(0.0, 100.0)
    }

    /// Seconds left in the whole job, assuming later passes run at the current speed.
    pub fn overall_eta_secs(&self) -> Option<f64> {
        let current = self.eta_secs()?;
        let speed = self.latest?.speed?;
        let remaining_passes = (self.passes - self.pass) as f64;
        Some(current + remaining_passes * self.total_secs / speed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const STATUS: &str =
        "frame=  720 fps= 48 q=28.0 size=    1024kB time=00:00:30.00 bitrate= 279.6kbits/s speed=2.00x";

    #[test]
    fn test_thirty_of_one_twenty_is_quarter() {
        let mut parser = ProgressParser::new(120.0);
        assert!(parser.feed(STATUS));
        assert!((parser.percent() - 25.0).abs() < 0.01);
        assert_eq!(parser.eta_secs(), Some(45.0));
    }

    #[test]
    fn test_parse_line_tokens() {
        let sample = parse_line(STATUS).unwrap();
        assert_eq!(sample.elapsed_secs, 30.0);
        assert_eq!(sample.speed, Some(2.0));

        let padded = parse_line("time=01:02:03.50 speed= 0.5x").unwrap();
        assert_eq!(padded.elapsed_secs, 3723.5);
        assert_eq!(padded.speed, Some(0.5));

        let progress_pipe = parse_line("out_time=00:00:10.000000").unwrap();
        assert_eq!(progress_pipe.elapsed_secs, 10.0);
        assert_eq!(progress_pipe.speed, None);
    }

    #[test]
    fn test_noise_ignored() {
        let mut parser = ProgressParser::new(60.0);
        assert!(parser.feed("time=00:00:15.00 speed=1x"));
        for line in [
            "",
            "Stream mapping:",
            "time=N/A bitrate=N/A speed=N/A",
            "time=00:00",
            "frame=  10 fps=0.0 q=0.0 size=       0kB time=",
            "[libx264 @ 0x55] using cpu capabilities: MMX2 SSE2Fast",
        ] {
            assert!(!parser.feed(line), "{line:?}");
        }
        assert!((parser.percent() - 25.0).abs() < 0.01);
    }

    #[test]
    fn test_zero_speed_has_no_eta() {
        let mut parser = ProgressParser::new(60.0);
        parser.feed("time=00:00:01.00 speed=0x");
        assert_eq!(parser.eta_secs(), None);
        assert!(parser.percent() > 0.0);
    }

    #[test]
    fn test_latest_line_wins() {
        let mut parser = ProgressParser::new(100.0);
        parser.feed("time=00:00:50.00 speed=1x");
        parser.feed("time=00:00:20.00 speed=1x");
        assert!((parser.percent() - 20.0).abs() < 0.01);
    }

    #[test]
    fn test_two_pass_mapping() {
        let mut first = ProgressParser::for_pass(120.0, 1, 2);
        first.feed(STATUS);
        assert!((first.overall_percent() - 12.5).abs() < 0.01);
        // 45 s left in pass 1, plus 60 s for pass 2 at 2x
        assert_eq!(first.overall_eta_secs(), Some(105.0));

        let mut second = ProgressParser::for_pass(120.0, 2, 2);
        second.feed("time=00:02:00.00 speed=2x");
        assert!((second.overall_percent() - 100.0).abs() < 0.01);
        assert_eq!(second.overall_eta_secs(), Some(0.0));
    }

    // Percent stays within bounds whatever the reported time.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_percent_clamped(
            h in 0u32..10,
            m in 0u32..60,
            s in 0.0f64..60.0,
            total in 0.1f64..10_000.0,
            pass in 1u8..=2,
        ) {
            let line = format!("time={:02}:{:02}:{:05.2} speed=1.5x", h, m, s);
            let mut parser = ProgressParser::for_pass(total, pass, 2);
            prop_assert!(parser.feed(&line));
            let p = parser.percent();
            prop_assert!((0.0..=100.0).contains(&p));
            let o = parser.overall_percent();
            prop_assert!((0.0..=100.0).contains(&o));
            prop_assert!(parser.eta_secs().unwrap() >= 0.0);
        }

        #[test]
        fn prop_garbage_never_panics(line in ".*") {
            let mut parser = ProgressParser::new(10.0);
            parser.feed(&line);
            prop_assert!((0.0..=100.0).contains(&parser.percent()));
        }
    }
}
