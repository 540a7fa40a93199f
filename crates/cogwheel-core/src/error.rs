//! Error types for Cogwheel Core.

use std::fmt;

/// The main error type for Cogwheel operations.
#[derive(Debug)]
pub enum CoreError {
    /// Graph-related error.
    Graph(GraphError),
    /// Task scheduling error.
    Task(TaskError),
    /// Timer-related error.
    Timer(TimerError),
    /// Sync-group error.
    Sync(SyncError),
    /// Serialization boundary error.
    Serialize(String),
    /// Deserialization boundary error.
    Deserialize(String),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graph(err) => write!(f, "Graph error: {err}"),
            Self::Task(err) => write!(f, "Task error: {err}"),
            Self::Timer(err) => write!(f, "Timer error: {err}"),
            Self::Sync(err) => write!(f, "Sync error: {err}"),
            Self::Serialize(msg) => write!(f, "Failed to serialize runtime state: {msg}"),
            Self::Deserialize(msg) => write!(f, "Failed to deserialize runtime state: {msg}"),
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Graph(err) => Some(err),
            Self::Task(err) => Some(err),
            Self::Timer(err) => Some(err),
            Self::Sync(err) => Some(err),
            _ => None,
        }
    }
}

/// Graph-specific errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// The location ID is stale or has been destroyed.
    InvalidLocation,
    /// The connection ID is stale or has already been removed.
    InvalidConnection,
    /// A connection target failed the argument's requirements.
    RequirementsNotMet(String),
    /// The named prototype is not registered.
    UnknownPrototype(String),
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidLocation => write!(f, "Invalid or destroyed location ID"),
            Self::InvalidConnection => write!(f, "Invalid or removed connection ID"),
            Self::RequirementsNotMet(msg) => {
                write!(f, "Connection target does not satisfy requirements: {msg}")
            }
            Self::UnknownPrototype(name) => write!(f, "No prototype registered as {name:?}"),
        }
    }
}

impl std::error::Error for GraphError {}

impl From<GraphError> for CoreError {
    fn from(err: GraphError) -> Self {
        Self::Graph(err)
    }
}

/// Task-scheduling errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The task is already sitting in the ready queue.
    AlreadyScheduled,
    /// The task ID is stale or has already executed.
    InvalidTask,
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyScheduled => write!(f, "Task is already scheduled"),
            Self::InvalidTask => write!(f, "Invalid or completed task ID"),
        }
    }
}

impl std::error::Error for TaskError {}

impl From<TaskError> for CoreError {
    fn from(err: TaskError) -> Self {
        Self::Task(err)
    }
}

/// Timer-specific errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerError {
    /// The deadline being rescheduled is no longer present in the queue.
    DeadlineNotFound,
    /// The timer service has been stopped.
    ServiceStopped,
}

impl fmt::Display for TimerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeadlineNotFound => write!(f, "Deadline not found in timer queue"),
            Self::ServiceStopped => write!(f, "Timer service has been stopped"),
        }
    }
}

impl std::error::Error for TimerError {}

impl From<TimerError> for CoreError {
    fn from(err: TimerError) -> Self {
        Self::Timer(err)
    }
}

/// Sync-group errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The instance is not a member of any sync group.
    NotSynced,
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotSynced => write!(f, "Instance is not part of a sync group"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<SyncError> for CoreError {
    fn from(err: SyncError) -> Self {
        Self::Sync(err)
    }
}

/// A specialized Result type for Cogwheel operations.
pub type Result<T> = std::result::Result<T, CoreError>;
