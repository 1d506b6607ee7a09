use {
    std::{any::Any, fmt},
    thiserror::Error,
};

/// What a task wants next.
///
/// A task result crosses every suspension boundary:
/// it is passed to [`yield_with`] inside the fiber
/// and returned from [`enter`] outside of it.
///
/// [`yield_with`]: `crate::yield_with`
/// [`enter`]: `crate::FiberCtx::enter`
#[derive(Debug)]
pub enum TaskResult
{
    /// The task suspended itself and expects to be resumed later.
    Waiting,

    /// The task function returned normally.
    Done,

    /// The task function failed.
    Failed(TaskError),
}

/// Error raised by a task function.
///
/// This is either the error returned by the task function,
/// or a [`TaskPanic`] if the task function panicked.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct TaskError(anyhow::Error);

/// Payload of a task error caused by a panic.
#[derive(Debug, Error)]
#[error("Task panicked: {message}")]
pub struct TaskPanic
{
    /// The panic message, if the payload was a string.
    pub message: String,
}

/// Return types of task functions.
///
/// Task functions either return nothing, or a result.
pub trait TaskReturn
{
    /// Convert the returned value into the outcome of the task.
    fn into_outcome(self) -> Result<(), TaskError>;
}

impl TaskResult
{
    /// Whether the task suspended itself.
    pub fn is_waiting(&self) -> bool
    {
        matches!(self, Self::Waiting)
    }

    /// Whether the task function returned normally.
    pub fn is_done(&self) -> bool
    {
        matches!(self, Self::Done)
    }

    /// Whether the task function failed.
    pub fn is_failed(&self) -> bool
    {
        matches!(self, Self::Failed(_))
    }

    /// The error, if the task function failed.
    pub fn error(&self) -> Option<&TaskError>
    {
        match self {
            Self::Failed(error) => Some(error),
            _                   => None,
        }
    }
}

impl fmt::Display for TaskResult
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        match self {
            Self::Waiting       => write!(f, "waiting"),
            Self::Done          => write!(f, "done"),
            Self::Failed(error) => write!(f, "failed: {}", error),
        }
    }
}

impl TaskError
{
    /// Create a task error from a panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self
    {
        let message =
            if let Some(message) = payload.downcast_ref::<&str>() {
                message.to_string()
            } else if let Some(message) = payload.downcast_ref::<String>() {
                message.clone()
            } else {
                "Box<dyn Any>".to_owned()
            };
        Self(anyhow::Error::new(TaskPanic{message}))
    }

    /// Whether the task function panicked.
    pub fn is_panic(&self) -> bool
    {
        self.0.is::<TaskPanic>()
    }

    /// The underlying error.
    pub fn as_anyhow(&self) -> &anyhow::Error
    {
        &self.0
    }

    /// Take the underlying error.
    pub fn into_anyhow(self) -> anyhow::Error
    {
        self.0
    }
}

impl From<anyhow::Error> for TaskError
{
    fn from(other: anyhow::Error) -> Self
    {
        Self(other)
    }
}

impl TaskReturn for ()
{
    fn into_outcome(self) -> Result<(), TaskError>
    {
        Ok(())
    }
}

impl<E> TaskReturn for Result<(), E>
    where E: Into<anyhow::Error>
{
    fn into_outcome(self) -> Result<(), TaskError>
    {
        self.map_err(|err| TaskError(err.into()))
    }
}
