//! Scripted `CommandRunner` for tests.
//!
//! Responses are queued per `"<service> <operation>"` key. RDS port lookups
//! share an operation with endpoint lookups, so they are keyed
//! `"<service> <operation> port"`. The last queued response for a key keeps
//! answering once the queue drains.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

use super::runner::CommandRunner;

#[derive(Default)]
pub(crate) struct ScriptedRunner {
    responses: Mutex<HashMap<String, VecDeque<Option<String>>>>,
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl ScriptedRunner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue a response for `"<service> <operation>"`
    pub(crate) fn push(&self, key: &str, response: Option<&str>) -> &Self {
        self.responses
            .lock()
            .entry(key.to_string())
            .or_default()
            .push_back(response.map(str::to_string));
        self
    }

    /// Every call made so far as (profile, args)
    pub(crate) fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().clone()
    }

    /// Number of calls for a `"<service> <operation>"` key
    pub(crate) fn count(&self, key: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|(_, args)| key_of(args) == key)
            .count()
    }
}

fn key_of(args: &[String]) -> String {
    let mut key = args.iter().take(2).cloned().collect::<Vec<_>>().join(" ");
    if args.windows(2).any(|w| w[0] == "--query" && w[1].ends_with("Port")) {
        key.push_str(" port");
    }
    key
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, profile: &str, args: &[String]) -> Option<String> {
        let key = key_of(args);
        self.calls.lock().push((profile.to_string(), args.to_vec()));

        let mut responses = self.responses.lock();
        let queue = responses.get_mut(&key)?;
        if queue.len() > 1 {
            queue.pop_front().flatten()
        } else {
            queue.front().cloned().flatten()
        }
    }
}
