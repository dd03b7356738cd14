//! Render errors.

use edge_cache::FingerprintError;

/// Errors returned to render callers.
///
/// `Clone` so one failure can be handed to every caller waiting on the
/// same computation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    /// An argument has no stable serialized form, so no key can be derived.
    #[error("argument {index} of unit '{unit}' is not serializable: {reason}")]
    UnserializableArgument {
        unit: String,
        index: usize,
        reason: String,
    },

    /// The render unit itself failed.
    #[error("render unit '{unit}' failed: {message}")]
    ComputationFailure { unit: String, message: String },

    /// A unit included itself, directly or through other units.
    #[error("render unit '{unit}' includes itself: {}", .path.join(" -> "))]
    Cycle { unit: String, path: Vec<String> },
}

impl From<FingerprintError> for RenderError {
    fn from(err: FingerprintError) -> Self {
        match err {
            FingerprintError::UnserializableArgument { unit, index, reason } => {
                Self::UnserializableArgument {
                    unit,
                    index,
                    reason,
                }
            }
        }
    }
}

impl RenderError {
    /// Wrap a unit's own failure, keeping engine errors that passed through it.
    pub(crate) fn from_unit(unit: &str, err: anyhow::Error) -> Self {
        match err.downcast::<RenderError>() {
            Ok(inner) => inner,
            Err(err) => Self::ComputationFailure {
                unit: unit.to_string(),
                message: format!("{err:#}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_error_message_keeps_chain() {
        let err = anyhow::anyhow!("connection reset").context("loading price");
        let mapped = RenderError::from_unit("price", err);
        assert_eq!(
            mapped,
            RenderError::ComputationFailure {
                unit: "price".into(),
                message: "loading price: connection reset".into(),
            }
        );
    }

    #[test]
    fn test_engine_error_passes_through_unit() {
        let cycle = RenderError::Cycle {
            unit: "a".into(),
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        let mapped = RenderError::from_unit("b", anyhow::Error::new(cycle.clone()));
        assert_eq!(mapped, cycle);
        assert_eq!(mapped.to_string(), "render unit 'a' includes itself: a -> b -> a");
    }
}
