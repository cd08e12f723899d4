use size::{Size, Style};
use std::{
    fmt::{self, Display},
    time::{Duration, Instant},
};

const MIN_WINDOW: Duration = Duration::from_millis(100); // avoid huge rates right after a mark

/// Byte counters with a rolling window reset on every `mark`.
#[derive(Debug)]
pub struct BandwidthTracker {
    uploaded_bytes: u64,
    downloaded_bytes: u64,
    uploaded_since_mark: u64,
    downloaded_since_mark: u64,
    marked_at: Instant,
}

impl BandwidthTracker {
    pub fn new() -> Self {
        BandwidthTracker {
            uploaded_bytes: 0,
            downloaded_bytes: 0,
            uploaded_since_mark: 0,
            downloaded_since_mark: 0,
            marked_at: Instant::now(),
        }
    }

    pub fn add_uploaded_bytes(&mut self, bytes: u64) {
        self.uploaded_bytes += bytes;
        self.uploaded_since_mark += bytes;
    }

    pub fn add_downloaded_bytes(&mut self, bytes: u64) {
        self.downloaded_bytes += bytes;
        self.downloaded_since_mark += bytes;
    }

    /// Starts a new rate window.
    pub fn mark(&mut self) {
        self.uploaded_since_mark = 0;
        self.downloaded_since_mark = 0;
        self.marked_at = Instant::now();
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded_bytes
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded_bytes
    }

    pub fn uploaded_since_mark(&self) -> u64 {
        self.uploaded_since_mark
    }

    pub fn downloaded_since_mark(&self) -> u64 {
        self.downloaded_since_mark
    }

    fn window(&self) -> f64 {
        self.marked_at.elapsed().max(MIN_WINDOW).as_secs_f64()
    }

    /// B/s uploaded to the peer since the last mark.
    pub fn upload_rate(&self) -> f64 {
        self.uploaded_since_mark as f64 / self.window()
    }

    /// B/s downloaded from the peer since the last mark.
    pub fn download_rate(&self) -> f64 {
        self.downloaded_since_mark as f64 / self.window()
    }
}

impl Default for BandwidthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for BandwidthTracker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Down: {down_band}/s, Up: {up_band}/s (tot.: {tot_down}, {tot_up})",
            down_band = Size::from_bytes(self.download_rate())
                .format()
                .with_style(Style::Abbreviated),
            up_band = Size::from_bytes(self.upload_rate())
                .format()
                .with_style(Style::Abbreviated),
            tot_down = Size::from_bytes(self.downloaded_bytes)
                .format()
                .with_style(Style::Abbreviated),
            tot_up = Size::from_bytes(self.uploaded_bytes)
                .format()
                .with_style(Style::Abbreviated),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_resets_window_but_not_totals() {
        let mut bandwidth = BandwidthTracker::new();
        bandwidth.add_downloaded_bytes(1000);
        bandwidth.add_uploaded_bytes(10);
        assert!(bandwidth.download_rate() > 0.);
        assert!(bandwidth.download_rate() > bandwidth.upload_rate());

        bandwidth.mark();
        assert_eq!(bandwidth.download_rate(), 0.);
        assert_eq!(bandwidth.downloaded_since_mark(), 0);
        assert_eq!(bandwidth.downloaded_bytes(), 1000);
        assert_eq!(bandwidth.uploaded_bytes(), 10);

        bandwidth.add_uploaded_bytes(5);
        assert_eq!(bandwidth.uploaded_since_mark(), 5);
        assert!(bandwidth.to_string().starts_with("Down: "));
    }
}
