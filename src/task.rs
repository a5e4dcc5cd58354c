//! One file's download state within a site.
//!
//! A [`FileTask`] moves through `Pending -> Running -> {Done-success,
//! Done-failure}`. Once `done` is set the task is never re-queued: only the
//! scheduler assigns a peer, only that peer appends to `buffer`, and only the
//! task finalizer sets `done`/`success`.
use crate::crypto;

pub const PRIORITY_CONTENT_JSON: i32 = 9999;
pub const PRIORITY_INDEX_HTML: i32 = 9990;
pub const PRIORITY_INCLUDE: i32 = 9000;
pub const PRIORITY_DEFAULT: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    DoneSuccess,
    DoneFailure,
}

#[derive(Debug)]
pub struct FileTask {
    pub inner_path: String,
    pub site_address: String,
    pub expected_digest: String,
    pub expected_size: u64,
    pub priority: i32,
    pub offset_bytes: u64,
    pub buffer: Vec<u8>,
    pub started: bool,
    pub done: bool,
    pub success: bool,
    pub peers_attached: u32,
    /// Monotonic, used only for deterministic tie-breaking of priority sort.
    pub sequence: u64,
}

impl FileTask {
    pub fn new(
        inner_path: impl Into<String>,
        site_address: impl Into<String>,
        expected_digest: impl Into<String>,
        expected_size: u64,
        sequence: u64,
    ) -> Self {
        let inner_path = inner_path.into();
        let priority = priority_for(&inner_path);
        Self {
            inner_path,
            site_address: site_address.into(),
            expected_digest: expected_digest.into(),
            expected_size,
            priority,
            offset_bytes: 0,
            buffer: Vec::new(),
            started: false,
            done: false,
            success: false,
            peers_attached: 0,
            sequence,
        }
    }

    pub fn status(&self) -> TaskStatus {
        match (self.done, self.success, self.started) {
            (true, true, _) => TaskStatus::DoneSuccess,
            (true, false, _) => TaskStatus::DoneFailure,
            (false, _, true) => TaskStatus::Running,
            (false, _, false) => TaskStatus::Pending,
        }
    }

    pub fn mark_started(&mut self) {
        self.started = true;
    }

    /// Appends a chunk received at `location` to the task's buffer.
    pub fn append_chunk(&mut self, location: u64, data: &[u8]) {
        if location == self.offset_bytes {
            self.buffer.extend_from_slice(data);
            self.offset_bytes += data.len() as u64;
        } else if location < self.offset_bytes {
            // Already have this range (duplicate delivery); ignore.
        } else {
            // A gap would indicate a protocol violation; extend with zero
            // padding defensively rather than panic, the finalizer will
            // catch the resulting digest mismatch.
            self.buffer
                .resize((location - self.offset_bytes) as usize + self.buffer.len(), 0);
            self.buffer.extend_from_slice(data);
            self.offset_bytes = location + data.len() as u64;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.expected_size == 0 || self.offset_bytes >= self.expected_size
    }

    /// Finalizes the task: verifies the digest (if any) against the
    /// accumulated buffer and marks it done. Returns whether verification
    /// passed (always true when no digest is expected).
    pub fn finish(&mut self) -> bool {
        if self.done {
            return self.success;
        }
        let ok = if self.expected_digest.is_empty() {
            true
        } else {
            crypto::verify_digest(&self.buffer, &self.expected_digest)
        };
        self.done = true;
        self.success = ok;
        ok
    }

    pub fn fail(&mut self) {
        if !self.done {
            self.done = true;
            self.success = false;
        }
    }
}

/// Priority assignment rule from the manifest: `content.json` and
/// `index.html` are prioritized above ordinary files, includes above that.
pub fn priority_for(inner_path: &str) -> i32 {
    match inner_path {
        "content.json" => PRIORITY_CONTENT_JSON,
        "index.html" => PRIORITY_INDEX_HTML,
        _ => PRIORITY_DEFAULT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_rule_matches_spec() {
        assert_eq!(priority_for("content.json"), PRIORITY_CONTENT_JSON);
        assert_eq!(priority_for("index.html"), PRIORITY_INDEX_HTML);
        assert_eq!(priority_for("style.css"), PRIORITY_DEFAULT);
    }

    #[test]
    fn finish_verifies_digest() {
        let digest = crypto::sha512_hex(b"hi\n");
        let mut task = FileTask::new("hello.txt", "addr", digest, 3, 0);
        task.append_chunk(0, b"hi\n");
        assert!(task.is_complete());
        assert!(task.finish());
        assert!(task.success);
        assert_eq!(task.status(), TaskStatus::DoneSuccess);
    }

    #[test]
    fn finish_detects_mismatch() {
        let digest = crypto::sha512_hex(b"hi\n");
        let mut task = FileTask::new("hello.txt", "addr", digest, 3, 0);
        task.append_chunk(0, b"ho\n");
        assert!(!task.finish());
        assert!(!task.success);
        assert_eq!(task.status(), TaskStatus::DoneFailure);
    }

    #[test]
    fn zero_size_task_completes_without_digest() {
        let mut task = FileTask::new("content.json", "addr", "", 0, 0);
        assert!(task.is_complete());
        assert!(task.finish());
    }

    #[test]
    fn finish_is_idempotent() {
        let mut task = FileTask::new("a.txt", "addr", "", 0, 0);
        assert!(task.finish());
        task.buffer.extend_from_slice(b"more"); // would fail digest if re-checked
        assert!(task.finish());
    }
}
