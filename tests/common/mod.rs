//! Shared fixtures: a scripted in-memory batch API and row/CSV builders.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use batchmerge::{
    ApiError, BatchApi, BatchSubmission, RemoteState, RetryPolicy, RunParams, StatusReport,
};

/// How the remote side treats one accepted submission
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    /// Every row comes back with content
    Succeed,
    /// Rows with these indices are left out of the payload
    SucceedExcept(Vec<usize>),
    /// The remote job fails with this message
    Fail(String),
    /// The submission id is forgotten; polls answer "not found"
    Vanish,
}

#[derive(Debug)]
struct Job {
    seq: u32,
    indices: Vec<usize>,
    plan: Plan,
    running_polls: u32,
    settled: bool,
}

#[derive(Default)]
struct Script {
    next_id: u32,
    plans: HashMap<u32, VecDeque<Plan>>,
    submit_failures: HashMap<u32, u32>,
    unreadable: Vec<usize>,
    running_polls: u32,
    jobs: HashMap<String, Job>,
    submissions: Vec<(u32, u32, String)>,
    polls: usize,
    open: usize,
    max_open: usize,
}

/// In-memory [`BatchApi`] whose remote behaviour is scripted per batch seq.
/// Unscripted submissions succeed on the first poll.
#[derive(Default)]
pub struct ScriptedApi {
    script: Mutex<Script>,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for successive accepted submissions of `seq`.
    pub fn plan(&self, seq: u32, plans: impl IntoIterator<Item = Plan>) -> &Self {
        let mut script = self.script.lock().unwrap();
        script.plans.entry(seq).or_default().extend(plans);
        self
    }

    /// Reject the next `count` submission calls for `seq` with a transport error.
    pub fn fail_submits(&self, seq: u32, count: u32) -> &Self {
        self.script.lock().unwrap().submit_failures.insert(seq, count);
        self
    }

    /// Rows whose image the client cannot read: left out of every upload,
    /// like the OpenAI client does.
    pub fn unreadable_rows(&self, indices: impl IntoIterator<Item = usize>) -> &Self {
        self.script.lock().unwrap().unreadable.extend(indices);
        self
    }

    /// Number of `running` answers each job gives before its terminal state.
    pub fn running_polls(&self, polls: u32) -> &Self {
        self.script.lock().unwrap().running_polls = polls;
        self
    }

    /// Accepted submissions of `seq`
    pub fn submissions_of(&self, seq: u32) -> usize {
        let script = self.script.lock().unwrap();
        script.submissions.iter().filter(|(s, _, _)| *s == seq).count()
    }

    /// `(seq, attempt)` of every accepted submission, in order
    pub fn submission_log(&self) -> Vec<(u32, u32)> {
        let script = self.script.lock().unwrap();
        script.submissions.iter().map(|(s, a, _)| (*s, *a)).collect()
    }

    pub fn total_submissions(&self) -> usize {
        self.script.lock().unwrap().submissions.len()
    }

    pub fn poll_calls(&self) -> usize {
        self.script.lock().unwrap().polls
    }

    /// Highest number of accepted jobs that had not yet reported a final state
    pub fn max_open_jobs(&self) -> usize {
        self.script.lock().unwrap().max_open
    }
}

impl BatchApi for ScriptedApi {
    fn submit_batch(&self, submission: &BatchSubmission<'_>) -> Result<String, ApiError> {
        let mut script = self.script.lock().unwrap();
        if let Some(left) = script.submit_failures.get_mut(&submission.seq) {
            if *left > 0 {
                *left -= 1;
                return Err(ApiError::Transport("connection reset".to_string()));
            }
        }
        let indices: Vec<usize> = submission
            .items
            .iter()
            .map(|i| i.index)
            .filter(|i| !script.unreadable.contains(i))
            .collect();
        if indices.is_empty() {
            return Err(ApiError::NothingToSubmit);
        }
        script.next_id += 1;
        let id = format!("batch_{}", script.next_id);
        let plan = script
            .plans
            .get_mut(&submission.seq)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Plan::Succeed);
        let running_polls = script.running_polls;
        script.jobs.insert(
            id.clone(),
            Job {
                seq: submission.seq,
                indices,
                plan,
                running_polls,
                settled: false,
            },
        );
        script.open += 1;
        script.max_open = script.max_open.max(script.open);
        script
            .submissions
            .push((submission.seq, submission.attempt, id.clone()));
        Ok(id)
    }

    fn poll_status(&self, submission_id: &str) -> Result<StatusReport, ApiError> {
        let mut guard = self.script.lock().unwrap();
        let script = &mut *guard;
        script.polls += 1;
        let job = script
            .jobs
            .get_mut(submission_id)
            .ok_or_else(|| ApiError::NotFound(submission_id.to_string()))?;
        if job.running_polls > 0 && job.plan != Plan::Vanish {
            job.running_polls -= 1;
            return Ok(StatusReport::new(RemoteState::Running));
        }
        if !job.settled {
            job.settled = true;
            script.open -= 1;
        }
        if job.plan == Plan::Vanish {
            return Err(ApiError::NotFound(submission_id.to_string()));
        }
        Ok(match &job.plan {
            Plan::Fail(message) => StatusReport {
                error: Some(message.clone()),
                ..StatusReport::new(RemoteState::Failed)
            },
            _ => StatusReport {
                result_location: Some(format!("file-{submission_id}")),
                ..StatusReport::new(RemoteState::Succeeded)
            },
        })
    }

    fn fetch_result(&self, result_location: &str) -> Result<String, ApiError> {
        let script = self.script.lock().unwrap();
        let id = result_location
            .strip_prefix("file-")
            .ok_or_else(|| ApiError::NotFound(result_location.to_string()))?;
        let job = script
            .jobs
            .get(id)
            .ok_or_else(|| ApiError::NotFound(result_location.to_string()))?;
        let skipped: &[usize] = match &job.plan {
            Plan::SucceedExcept(skip) => skip,
            _ => &[],
        };
        let mut payload = String::new();
        for index in job.indices.iter().filter(|i| !skipped.contains(i)) {
            payload.push_str(&ok_line(*index, &answer(job.seq, *index)));
            payload.push('\n');
        }
        Ok(payload)
    }
}

/// Content the scripted API returns for `index` when answered by batch `seq`
pub fn answer(seq: u32, index: usize) -> String {
    format!("row {index} answered by batch {seq}")
}

/// One successful response line in the batch output format
pub fn ok_line(index: usize, content: &str) -> String {
    serde_json::json!({
        "id": format!("resp_{index}"),
        "custom_id": format!("row_{index}"),
        "response": {
            "status_code": 200,
            "body": {
                "choices": [ { "index": 0, "message": { "role": "assistant", "content": content } } ]
            }
        },
        "error": null
    })
    .to_string()
}

/// Write a source CSV with `rows` data rows using the default column names.
pub fn write_rows_csv(dir: &Path, rows: usize) -> PathBuf {
    let path = dir.join("rows.csv");
    let mut text = String::from("Image Path,Content of P*,Notes\n");
    for i in 0..rows {
        text.push_str(&format!("images/{i:04}.jpg,Describe image {i},n{i}\n"));
    }
    std::fs::write(&path, text).unwrap();
    path
}

/// Parameters with every wait set to zero.
pub fn fast_params(batch_size: usize) -> RunParams {
    RunParams {
        batch_size,
        retry: RetryPolicy::immediate(),
        ..RunParams::default()
    }
}
