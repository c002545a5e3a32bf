use crate::cancel::CancelFlag;
use bos_error::ToolboxResult;

pub type StageFn<'a, S> = Box<dyn Fn(&mut S, bool) -> ToolboxResult<()> + 'a>;

pub struct StageDefinition<'a, S> {
    pub name: &'a str,
    pub run: StageFn<'a, S>,
}

pub trait WorkflowState {
    /// Host the workflow runs against, for log lines.
    fn host(&self) -> &str;
    fn set_current(&mut self, stage: &str);
    fn mark_completed(&mut self, stage: &str);
}

/// Runs stages in order, stopping at the first error or user interrupt.
pub struct StageRunner<'c> {
    cancel: &'c CancelFlag,
    dry_run: bool,
}

impl<'c> StageRunner<'c> {
    pub fn new(cancel: &'c CancelFlag, dry_run: bool) -> Self {
        Self { cancel, dry_run }
    }

    pub fn run<S: WorkflowState>(
        &self,
        state: &mut S,
        stages: &[StageDefinition<'_, S>],
    ) -> ToolboxResult<()> {
        for stage in stages {
            self.cancel.check()?;
            state.set_current(stage.name);
            log::info!("[{}] {}", state.host(), stage.name);

            if let Err(err) = (stage.run)(state, self.dry_run) {
                log::error!("[{}] {} failed: {}", state.host(), stage.name, err);
                return Err(err);
            }

            state.mark_completed(stage.name);
        }
        Ok(())
    }
}
