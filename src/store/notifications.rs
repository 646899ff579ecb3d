use crate::core::{DbError, Result, TypedValue};
use crate::store::layout::RepoLayout;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// One retained event notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetainedNotification {
    pub xpath: String,
    pub values: Vec<TypedValue>,
    /// Seconds since the epoch, stamped at send time.
    pub timestamp: i64,
}

/// Retained-notification store under `<repo>/data/notifications/`.
///
/// Notifications are appended as length-prefixed MessagePack frames into one
/// file per time window; whole files age out together.
pub struct NotificationStore {
    dir: PathBuf,
    window: Duration,
    age_out: Duration,
}

impl NotificationStore {
    pub fn new(layout: &RepoLayout, window: Duration, age_out: Duration) -> Self {
        Self {
            dir: layout.notification_dir(),
            window,
            age_out,
        }
    }

    pub fn now_timestamp() -> i64 {
        Utc::now().timestamp()
    }

    fn window_start(&self, timestamp: i64) -> i64 {
        let width = self.window.as_secs().max(1) as i64;
        timestamp - timestamp.rem_euclid(width)
    }

    fn window_file(&self, window_start: i64) -> PathBuf {
        self.dir.join(format!("{}.ntf", window_start))
    }

    pub fn append(&self, notification: &RetainedNotification) -> Result<()> {
        let serialized = rmp_serde::to_vec(notification)
            .map_err(|e| DbError::Internal(format!("notification encode: {}", e)))?;
        let len = serialized.len() as u32;
        let mut payload = Vec::with_capacity(4 + serialized.len());
        payload.extend_from_slice(&len.to_le_bytes());
        payload.extend_from_slice(&serialized);

        let path = self.window_file(self.window_start(notification.timestamp));
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(&payload)?;
        Ok(())
    }

    /// Replay notifications within `[since, until]`, optionally filtered by
    /// an xpath prefix.
    pub fn replay(
        &self,
        xpath_prefix: Option<&str>,
        since: i64,
        until: i64,
    ) -> Result<Vec<RetainedNotification>> {
        let mut result = Vec::new();
        let width = self.window.as_secs().max(1) as i64;
        let mut window = self.window_start(since);
        while window <= until {
            let path = self.window_file(window);
            if path.exists() {
                for notification in read_frames(&path)? {
                    if notification.timestamp < since || notification.timestamp > until {
                        continue;
                    }
                    if let Some(prefix) = xpath_prefix {
                        if !notification.xpath.starts_with(prefix) {
                            continue;
                        }
                    }
                    result.push(notification);
                }
            }
            window += width;
        }
        result.sort_by_key(|n| n.timestamp);
        Ok(result)
    }

    /// Drop window files whose entire range is past the age-out bound.
    /// Returns the number of files removed.
    pub fn purge_aged(&self, now: i64) -> Result<usize> {
        let cutoff = now - self.age_out.as_secs() as i64;
        let width = self.window.as_secs().max(1) as i64;
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".ntf")) else {
                continue;
            };
            let Ok(window_start) = stem.parse::<i64>() else {
                continue;
            };
            if window_start + width < cutoff {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "aged notification windows purged");
        }
        Ok(removed)
    }
}

fn read_frames(path: &PathBuf) -> Result<Vec<RetainedNotification>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut frames = Vec::new();
    loop {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;
        let notification: RetainedNotification = rmp_serde::from_slice(&data)
            .map_err(|e| DbError::Internal(format!("notification decode: {}", e)))?;
        frames.push(notification);
    }
    Ok(frames)
}
