// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! A trace decoder with canned answers.

use remote_capture::trace::QueryError;
use remote_capture::trace::TraceDecoder;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

/// Answers each display filter with a fixed list of records; unknown
/// filters match nothing. Every call is recorded.
#[derive(Default)]
pub struct ScriptedDecoder {
    answers: HashMap<String, Vec<String>>,
    missing: bool,
    calls: Mutex<Vec<(PathBuf, String)>>,
}

impl ScriptedDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer<I, S>(mut self, filter: impl Into<String>, records: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let records = records.into_iter().map(Into::into).collect();
        self.answers.insert(filter.into(), records);
        self
    }

    /// Behave as if the decoder is not installed.
    pub fn missing() -> Self {
        Self { missing: true, ..Self::default() }
    }

    pub fn calls(&self) -> Vec<(PathBuf, String)> {
        self.calls.lock().unwrap().clone()
    }
}

impl TraceDecoder for ScriptedDecoder {
    fn decode(
        &self,
        artifact: &Path,
        filter: &str,
    ) -> Result<Vec<String>, QueryError> {
        self.calls
            .lock()
            .unwrap()
            .push((artifact.to_path_buf(), filter.to_string()));

        if self.missing {
            return Err(QueryError::ToolMissing {
                tool: "tshark".to_string(),
                searched: "/nonexistent".to_string(),
            });
        }

        Ok(self.answers.get(filter).cloned().unwrap_or_default())
    }
}
