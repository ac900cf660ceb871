/// [`TimeoutStream`](timeout::TimeoutStream) idle-read guard used by feed consumers.
pub mod timeout;
