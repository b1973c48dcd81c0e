use std::sync::Arc;

use crate::proto::proto;
use crate::result::ResultSet;
use crate::sql::{ClientId, SqlInner};
use crate::statement::Statement;
use crate::value::IntMode;
use crate::{ProtocolError, ResponseError, Result, Version};

/// An ordered list of statements executed server-side in one round trip.
///
/// Each step carries an optional boolean condition over the outcomes of
/// earlier steps; a step whose condition evaluates to false is skipped.
/// Executing a batch consumes it, so a batch cannot run twice.
#[derive(Debug, Default)]
pub struct Batch {
    steps: Vec<Step>,
}

#[derive(Debug)]
struct Step {
    condition: Option<BatchCond>,
    stmt: Statement,
}

/// Condition guarding a batch step.
#[derive(Debug, Clone)]
pub enum BatchCond {
    /// True when the referenced step finished successfully.
    Ok { step: u32 },
    /// True when the referenced step failed.
    Error { step: u32 },
    Not(Box<BatchCond>),
    /// Conjunction; `And(vec![])` is true.
    And(Vec<BatchCond>),
    /// Disjunction; `Or(vec![])` is false.
    Or(Vec<BatchCond>),
    /// True when the connection is in autocommit mode (protocol >= 3).
    IsAutocommit,
}

impl BatchCond {
    fn validate(&self, registered_steps: u32) -> Result<()> {
        match self {
            BatchCond::Ok { step } | BatchCond::Error { step } => {
                if *step >= registered_steps {
                    return Err(crate::Error::Misuse(format!(
                        "condition refers to step {step}, which is not registered yet"
                    )));
                }
            }
            BatchCond::Not(cond) => cond.validate(registered_steps)?,
            BatchCond::And(conds) | BatchCond::Or(conds) => {
                for cond in conds {
                    cond.validate(registered_steps)?;
                }
            }
            BatchCond::IsAutocommit => {}
        }
        Ok(())
    }

    fn min_version(&self) -> Version {
        match self {
            BatchCond::Ok { .. } | BatchCond::Error { .. } => Version::Hrana1,
            BatchCond::Not(cond) => cond.min_version(),
            BatchCond::And(conds) | BatchCond::Or(conds) => conds
                .iter()
                .map(BatchCond::min_version)
                .max()
                .unwrap_or(Version::Hrana1),
            BatchCond::IsAutocommit => Version::Hrana3,
        }
    }

    fn into_proto(self) -> proto::BatchCond {
        match self {
            BatchCond::Ok { step } => proto::BatchCond::Ok { step },
            BatchCond::Error { step } => proto::BatchCond::Error { step },
            BatchCond::Not(cond) => proto::BatchCond::Not {
                cond: Box::new(cond.into_proto()),
            },
            BatchCond::And(conds) => proto::BatchCond::And(proto::BatchCondList {
                conds: conds.into_iter().map(BatchCond::into_proto).collect(),
            }),
            BatchCond::Or(conds) => proto::BatchCond::Or(proto::BatchCondList {
                conds: conds.into_iter().map(BatchCond::into_proto).collect(),
            }),
            BatchCond::IsAutocommit => proto::BatchCond::IsAutocommit {},
        }
    }
}

impl Batch {
    pub fn new() -> Self {
        Batch::default()
    }

    /// Appends an unconditional step and returns its index.
    pub fn step(&mut self, stmt: impl Into<Statement>) -> u32 {
        let index = self.steps.len() as u32;
        self.steps.push(Step {
            condition: None,
            stmt: stmt.into(),
        });
        index
    }

    /// Appends a conditional step. The condition may only refer to steps
    /// that are already registered.
    pub fn step_with_cond(&mut self, cond: BatchCond, stmt: impl Into<Statement>) -> Result<u32> {
        cond.validate(self.steps.len() as u32)?;
        let index = self.steps.len() as u32;
        self.steps.push(Step {
            condition: Some(cond),
            stmt: stmt.into(),
        });
        Ok(index)
    }

    /// AND-joins another condition onto an existing step.
    pub fn condition(&mut self, step: u32, cond: BatchCond) -> Result<()> {
        cond.validate(step)?;
        let entry = self
            .steps
            .get_mut(step as usize)
            .ok_or_else(|| crate::Error::Misuse(format!("batch has no step {step}")))?;
        entry.condition = Some(match entry.condition.take() {
            None => cond,
            Some(BatchCond::And(mut conds)) => {
                conds.push(cond);
                BatchCond::And(conds)
            }
            Some(existing) => BatchCond::And(vec![existing, cond]),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Lowest protocol version able to execute this batch.
    pub(crate) fn min_version(&self) -> Version {
        self.steps
            .iter()
            .filter_map(|step| step.condition.as_ref())
            .map(BatchCond::min_version)
            .max()
            .unwrap_or(Version::Hrana1)
    }

    pub(crate) fn into_proto(
        self,
        client: &ClientId,
    ) -> Result<(proto::Batch, Vec<Arc<SqlInner>>)> {
        let mut stored = Vec::new();
        let mut steps = Vec::with_capacity(self.steps.len());
        for step in self.steps {
            let (stmt, sql) = step.stmt.into_proto(client)?;
            if let Some(sql) = sql {
                stored.push(sql);
            }
            steps.push(proto::BatchStep {
                condition: step.condition.map(BatchCond::into_proto),
                stmt,
            });
        }
        Ok((proto::Batch { steps }, stored))
    }
}

/// Outcome of a batch: for every step, at most one of result or error;
/// neither means the step was skipped.
#[derive(Debug)]
pub struct BatchResults {
    step_results: Vec<Option<ResultSet>>,
    step_errors: Vec<Option<ResponseError>>,
}

impl BatchResults {
    pub(crate) fn from_proto(result: proto::BatchResult, int_mode: IntMode) -> Result<Self> {
        let step_results = result
            .step_results
            .into_iter()
            .map(|result| result.map(|r| ResultSet::from_proto(r, int_mode)).transpose())
            .collect::<Result<Vec<_>>>()?;
        let step_errors: Vec<_> = result
            .step_errors
            .into_iter()
            .map(|error| error.map(ResponseError::from))
            .collect();
        for (step, result) in step_results.iter().enumerate() {
            if result.is_some() && step_errors.get(step).map_or(false, Option::is_some) {
                return Err(ProtocolError::BatchStepMismatch { step }.into());
            }
        }
        Ok(BatchResults {
            step_results,
            step_errors,
        })
    }

    /// Result of a successful step, `None` when it failed or was skipped.
    pub fn step_result(&self, step: u32) -> Option<&ResultSet> {
        self.step_results.get(step as usize)?.as_ref()
    }

    /// Error of a failed step, `None` when it succeeded or was skipped.
    pub fn step_error(&self, step: u32) -> Option<&ResponseError> {
        self.step_errors.get(step as usize)?.as_ref()
    }

    /// Whether the step was skipped because its condition was false.
    pub fn step_skipped(&self, step: u32) -> bool {
        self.step_result(step).is_none() && self.step_error(step).is_none()
    }

    pub fn into_parts(self) -> (Vec<Option<ResultSet>>, Vec<Option<ResponseError>>) {
        (self.step_results, self.step_errors)
    }
}
