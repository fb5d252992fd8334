//! Statistic extraction: p-values for the synthetic predictor.
//!
//! Terms are selected by their structured role and predictor, never by
//! prefix matching on generated labels, so `group2` or `s(time)` can not
//! be mistaken for the `group` terms.

use crate::model::{FittedModel, TermRole};
use crate::types::PValues;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExtractError {
    #[error("No parametric term for predictor '{0}'")]
    Missing(String),

    #[error("{count} parametric terms match predictor '{predictor}'")]
    Ambiguous { predictor: String, count: usize },
}

/// Pull the parametric p-value (exactly one) and the smooth p-values
/// (zero or more) for `predictor`.
pub fn extract_p_values(model: &FittedModel, predictor: &str) -> Result<PValues, ExtractError> {
    let parametric: Vec<f64> = model
        .parametric_by_role(TermRole::GroupEffect)
        .filter(|t| t.predictor.as_deref() == Some(predictor))
        .map(|t| t.p_value)
        .collect();

    let parametric = match parametric.as_slice() {
        [] => return Err(ExtractError::Missing(predictor.to_string())),
        [p] => *p,
        many => {
            return Err(ExtractError::Ambiguous {
                predictor: predictor.to_string(),
                count: many.len(),
            })
        }
    };

    let smooth = model
        .smooths_by_role(TermRole::DifferenceSmooth)
        .filter(|t| t.by.as_deref() == Some(predictor))
        .map(|t| t.p_value)
        .collect();

    Ok(PValues { parametric, smooth })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ParametricTerm, SmoothTerm};

    fn param(label: &str, role: TermRole, predictor: Option<&str>, p: f64) -> ParametricTerm {
        ParametricTerm {
            label: label.into(),
            role,
            predictor: predictor.map(String::from),
            estimate: 0.0,
            std_error: 1.0,
            t_value: 0.0,
            p_value: p,
        }
    }

    fn smooth(label: &str, role: TermRole, by: Option<&str>, p: f64) -> SmoothTerm {
        SmoothTerm {
            label: label.into(),
            role,
            by: by.map(String::from),
            rank: 4,
            f_value: 1.0,
            p_value: p,
        }
    }

    fn model(parametric: Vec<ParametricTerm>, smooths: Vec<SmoothTerm>) -> FittedModel {
        FittedModel {
            parametric,
            smooths,
            variance_components: vec![],
            residual_variance: 1.0,
            residual_df: 100.0,
            rho: None,
            n_obs: 110,
            iterations: 1,
        }
    }

    #[test]
    fn test_extracts_group_terms() {
        let m = model(
            vec![
                param("(Intercept)", TermRole::Intercept, None, 0.0),
                param("groupB", TermRole::GroupEffect, Some("group"), 0.03),
            ],
            vec![
                smooth("s(time)", TermRole::Smooth, None, 0.0),
                smooth("s(time):groupB", TermRole::DifferenceSmooth, Some("group"), 0.4),
            ],
        );
        let p = extract_p_values(&m, "group").unwrap();
        assert_eq!(p.parametric, 0.03);
        assert_eq!(p.smooth, vec![0.4]);
    }

    #[test]
    fn test_ignores_similarly_named_predictor() {
        let m = model(
            vec![
                param("group2B", TermRole::GroupEffect, Some("group2"), 0.001),
                param("groupB", TermRole::GroupEffect, Some("group"), 0.5),
            ],
            vec![smooth("s(time):group2B", TermRole::DifferenceSmooth, Some("group2"), 0.001)],
        );
        let p = extract_p_values(&m, "group").unwrap();
        assert_eq!(p.parametric, 0.5);
        assert!(p.smooth.is_empty());
    }

    #[test]
    fn test_missing_term_reported() {
        let m = model(vec![param("(Intercept)", TermRole::Intercept, None, 0.0)], vec![]);
        assert_eq!(
            extract_p_values(&m, "group").unwrap_err(),
            ExtractError::Missing("group".into())
        );
    }

    #[test]
    fn test_duplicate_term_is_ambiguous() {
        let m = model(
            vec![
                param("groupB", TermRole::GroupEffect, Some("group"), 0.1),
                param("groupB.1", TermRole::GroupEffect, Some("group"), 0.2),
            ],
            vec![],
        );
        assert!(matches!(
            extract_p_values(&m, "group"),
            Err(ExtractError::Ambiguous { count: 2, .. })
        ));
    }

    #[test]
    fn test_multiple_smooths_returned() {
        let m = model(
            vec![param("groupB", TermRole::GroupEffect, Some("group"), 0.2)],
            vec![
                smooth("s(time):groupB", TermRole::DifferenceSmooth, Some("group"), 0.1),
                smooth("s(time2):groupB", TermRole::DifferenceSmooth, Some("group"), 0.7),
            ],
        );
        assert_eq!(extract_p_values(&m, "group").unwrap().smooth, vec![0.1, 0.7]);
    }
}
