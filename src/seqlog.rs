//! Per-day binary sequence log.
//!
//! One record per sequence, little-endian:
//! `event_secs:i32 event_usecs:i32 beam:i32 tfreq:i32 nbad:i32`
//! followed by `nbad` pairs of `start_usec:u32 duration_usec:u32`.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::codec;
use crate::protocol::data::BadWindow;

/// Event times below this are treated as "controller clock not set".
const MIN_EVENT_SECS: i32 = 100;

/// Channel suffix used in file names.
pub fn channel_suffix(cnum: i32) -> &'static str {
    match cnum {
        1 => ".a",
        2 => ".b",
        3 => ".c",
        4 => ".d",
        _ => "",
    }
}

/// One sequence's entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeqLogEntry<'a> {
    pub event_secs: i32,
    pub event_usecs: i32,
    pub beam: i32,
    pub tfreq: i32,
    pub bad_windows: &'a [BadWindow],
}

impl SeqLogEntry<'_> {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(20 + 8 * self.bad_windows.len());
        codec::write_i32(&mut buf, self.event_secs);
        codec::write_i32(&mut buf, self.event_usecs);
        codec::write_i32(&mut buf, self.beam);
        codec::write_i32(&mut buf, self.tfreq);
        codec::write_i32(&mut buf, self.bad_windows.len() as i32);
        for w in self.bad_windows {
            codec::write_u32(&mut buf, w.start_usec);
            codec::write_u32(&mut buf, w.duration_usec);
        }
        buf
    }
}

pub struct SeqLog {
    dir: PathBuf,
    prefix: String,
    current: Option<(String, BufWriter<File>)>,
}

impl SeqLog {
    pub fn new(dir: impl Into<PathBuf>, station: &str, cnum: i32) -> Self {
        Self {
            dir: dir.into(),
            prefix: format!("seqlog.{station}{}", channel_suffix(cnum)),
            current: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_name(&self, day: &str) -> String {
        format!("{}.{day}", self.prefix)
    }

    /// Path of the file currently open, if any.
    pub fn current_path(&self) -> Option<PathBuf> {
        self.current.as_ref().map(|(day, _)| self.dir.join(self.file_name(day)))
    }

    /// Append one entry, switching files when the event date changes.
    pub fn write(&mut self, entry: &SeqLogEntry<'_>) -> io::Result<()> {
        let day = day_of(entry.event_secs);
        let reopen = self.current.as_ref().is_none_or(|(open, _)| *open != day);
        if reopen {
            self.close()?;
            let path = self.dir.join(self.file_name(&day));
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            info!(path = %path.display(), "sequence log opened");
            self.current = Some((day, BufWriter::new(file)));
        }
        if let Some((_, w)) = self.current.as_mut() {
            w.write_all(&entry.encode())?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        match self.current.as_mut() {
            Some((_, w)) => w.flush(),
            None => Ok(()),
        }
    }

    pub fn close(&mut self) -> io::Result<()> {
        if let Some((day, mut w)) = self.current.take() {
            w.flush()?;
            debug!(day, "sequence log closed");
        }
        Ok(())
    }
}

impl Drop for SeqLog {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn day_of(event_secs: i32) -> String {
    let when = if event_secs < MIN_EVENT_SECS {
        Utc::now()
    } else {
        DateTime::from_timestamp(i64::from(event_secs), 0).unwrap_or_else(Utc::now)
    };
    when.format("%Y%m%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("radarctl-seqlog-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn suffixes() {
        assert_eq!(channel_suffix(1), ".a");
        assert_eq!(channel_suffix(4), ".d");
        assert_eq!(channel_suffix(0), "");
    }

    #[test]
    fn entry_layout() {
        let windows = [BadWindow { start_usec: 5, duration_usec: 6 }];
        let e = SeqLogEntry { event_secs: 1, event_usecs: 2, beam: 3, tfreq: 4, bad_windows: &windows };
        let b = e.encode();
        assert_eq!(b.len(), 28);
        assert_eq!(&b[16..20], &1i32.to_le_bytes());
        assert_eq!(&b[24..28], &6u32.to_le_bytes());
    }

    #[test]
    fn rotates_on_event_date() {
        let dir = scratch("rotate");
        let mut log = SeqLog::new(&dir, "tst", 1);
        let entry = |secs| SeqLogEntry { event_secs: secs, event_usecs: 0, beam: 0, tfreq: 10400, bad_windows: &[] };
        // 2023-11-14 22:13:20 UTC
        log.write(&entry(1_700_000_000)).unwrap();
        assert_eq!(log.current_path().unwrap(), dir.join("seqlog.tst.a.20231114"));
        log.write(&entry(1_700_000_000 + 86_400)).unwrap();
        assert_eq!(log.current_path().unwrap(), dir.join("seqlog.tst.a.20231115"));
        log.close().unwrap();

        let first = std::fs::read(dir.join("seqlog.tst.a.20231114")).unwrap();
        assert_eq!(first.len(), 20);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
