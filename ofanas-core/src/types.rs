//! Fundamental types shared by the scheduler, the orchestrator and the CLI.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The two supernet families this system trains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Image classification (OFA MobileNetV3 supernet).
    Class,
    /// Stereo depth estimation (OFA AANet supernet).
    Stereo,
}

impl TaskType {
    pub const ALL: [TaskType; 2] = [TaskType::Class, TaskType::Stereo];

    /// Short tag used in log file names and checkpoint filters.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Class => "class",
            TaskType::Stereo => "stereo",
        }
    }

    /// Training entry point executed under the MPI launcher.
    ///
    /// Also serves as the marker used to recognise a running job in the
    /// process table.
    pub fn entry_script(&self) -> &'static str {
        match self {
            TaskType::Class => "train_ofa_net.py",
            TaskType::Stereo => "train_ofa_stereo.py",
        }
    }

    /// Log file name for a job of this task: `{job}_{task}.log`.
    pub fn log_file_name(&self, job_name: &str) -> String {
        format!("{job_name}_{}.log", self.as_str())
    }

    /// Recover the job name from a log file name, if it belongs to this task.
    pub fn job_name_from_log(&self, file_name: &str) -> Option<String> {
        let suffix = format!("_{}.log", self.as_str());
        file_name
            .strip_suffix(&suffix)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
    }

    pub fn default_batch_size(&self) -> u32 {
        match self {
            TaskType::Class => 16,
            TaskType::Stereo => 1,
        }
    }

    pub fn default_learning_rate(&self) -> f64 {
        match self {
            TaskType::Class => 0.04,
            TaskType::Stereo => 0.001,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "class" | "classification" => Ok(TaskType::Class),
            "stereo" | "depth" => Ok(TaskType::Stereo),
            other => Err(format!(
                "unknown task type '{other}' (expected 'class' or 'stereo')"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_scripts() {
        assert_eq!(TaskType::Class.entry_script(), "train_ofa_net.py");
        assert_eq!(TaskType::Stereo.entry_script(), "train_ofa_stereo.py");
    }

    #[test]
    fn test_log_file_name_roundtrip() {
        let file = TaskType::Class.log_file_name("expA");
        assert_eq!(file, "expA_class.log");
        assert_eq!(
            TaskType::Class.job_name_from_log(&file),
            Some("expA".to_string())
        );
    }

    #[test]
    fn test_job_name_keeps_inner_underscores() {
        assert_eq!(
            TaskType::Stereo.job_name_from_log("run_2_b_stereo.log"),
            Some("run_2_b".to_string())
        );
    }

    #[test]
    fn test_job_name_from_other_task_is_none() {
        assert_eq!(TaskType::Stereo.job_name_from_log("expA_class.log"), None);
        assert_eq!(TaskType::Class.job_name_from_log("_class.log"), None);
        assert_eq!(TaskType::Class.job_name_from_log("notes.txt"), None);
    }

    #[test]
    fn test_parse() {
        assert_eq!("class".parse::<TaskType>(), Ok(TaskType::Class));
        assert_eq!(" Stereo ".parse::<TaskType>(), Ok(TaskType::Stereo));
        assert!("detect".parse::<TaskType>().is_err());
    }

    #[test]
    fn test_defaults_match_dashboard() {
        assert_eq!(TaskType::Class.default_batch_size(), 16);
        assert_eq!(TaskType::Stereo.default_batch_size(), 1);
        assert_eq!(TaskType::Class.default_learning_rate(), 0.04);
        assert_eq!(TaskType::Stereo.default_learning_rate(), 0.001);
    }
}
