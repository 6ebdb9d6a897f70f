/// Pipeline lifecycle state shared by every stage instance.
///
/// The machine cycles for the life of the process; there is no terminal
/// state. All transitions are pure functions of (state, event) so they can
/// be tested without any runtime plumbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    /// Initial state; no dispatch happens until resumed.
    Paused,
    /// Accepting dispatch, nothing in flight.
    Running,
    /// A batch has been dispatched and is in flight.
    Processing,
    /// Pause requested while processing; the in-flight batch finishes first.
    Pausing,
    /// Accepting dispatch but the store had nothing eligible last check.
    Idle,
}

/// Events applied to the pipeline state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEvent {
    Resume,
    PauseRequested,
    /// A batch has been dispatched.
    StartProcessing,
    /// A work check found nothing eligible.
    NoWork,
    /// The in-flight batch finished.
    WorkCompleted { more_work: bool },
}

/// Apply one event to the current state.
///
/// Total over all (state, event) pairs: anything not explicitly rewired is a
/// self-transition. Pause takes priority once requested: `WorkCompleted`
/// from `Pausing` lands in `Paused` regardless of `more_work`.
pub fn transition(state: PipelineState, event: PipelineEvent) -> PipelineState {
    use PipelineEvent::*;
    use PipelineState::*;

    match (state, event) {
        (Paused, Resume) => Running,
        // Resume while a pause is pending cancels the pause; the batch is
        // still in flight.
        (Pausing, Resume) => Processing,

        (Processing, PauseRequested) => Pausing,
        (Running | Idle | Paused, PauseRequested) => Paused,
        (Pausing, PauseRequested) => Pausing,

        (Running | Idle, StartProcessing) => Processing,

        (Running, NoWork) => Idle,

        (Processing, WorkCompleted { more_work: true }) => Running,
        (Processing, WorkCompleted { more_work: false }) => Idle,
        (Pausing, WorkCompleted { .. }) => Paused,

        (other, _) => other,
    }
}

impl PipelineState {
    /// Whether the dispatcher may release new work in this state.
    pub fn accepts_dispatch(self) -> bool {
        matches!(self, PipelineState::Running | PipelineState::Idle)
    }

    /// Whether the pipeline is active (not paused and no pause pending).
    pub fn is_running(self) -> bool {
        !matches!(self, PipelineState::Paused | PipelineState::Pausing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineState::Paused => "paused",
            PipelineState::Running => "running",
            PipelineState::Processing => "processing",
            PipelineState::Pausing => "pausing",
            PipelineState::Idle => "idle",
        }
    }
}
