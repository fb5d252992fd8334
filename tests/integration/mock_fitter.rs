//! Mock fitter for integration testing.
//!
//! `MockFitter` is generated by mockall from the `ModelFitter` trait;
//! the helpers below build canned fitted models so tests can script
//! exactly which p-values (or errors) the pipeline sees.

use mockall::mock;

use gammsim::model::{
    FitError, FitRequest, FittedModel, ModelFitter, ParametricTerm, SmoothTerm, TermRole,
};

mock! {
    pub Fitter {}

    impl ModelFitter for Fitter {
        fn fit(&self, request: &FitRequest) -> Result<FittedModel, FitError>;
        fn name(&self) -> &str;
    }
}

/// A fitted model with one group term and one difference smooth for `predictor`.
pub fn fitted(predictor: &str, p_parametric: f64, p_smooth: f64) -> FittedModel {
    FittedModel {
        parametric: vec![
            ParametricTerm {
                label: "(Intercept)".into(),
                role: TermRole::Intercept,
                predictor: None,
                estimate: 0.0,
                std_error: 1.0,
                t_value: 0.0,
                p_value: 1.0,
            },
            ParametricTerm {
                label: format!("{predictor}B"),
                role: TermRole::GroupEffect,
                predictor: Some(predictor.to_string()),
                estimate: 0.1,
                std_error: 1.0,
                t_value: 0.1,
                p_value: p_parametric,
            },
        ],
        smooths: vec![SmoothTerm {
            label: format!("s(time):{predictor}B"),
            role: TermRole::DifferenceSmooth,
            by: Some(predictor.to_string()),
            rank: 4,
            f_value: 1.0,
            p_value: p_smooth,
        }],
        variance_components: vec![],
        residual_variance: 1.0,
        residual_df: 100.0,
        rho: None,
        n_obs: 110,
        iterations: 1,
    }
}

/// A mock that always returns `fitted(predictor, p, p)` and reports `name`.
pub fn constant(predictor: &'static str, p: f64) -> MockFitter {
    let mut mock = MockFitter::new();
    mock.expect_fit().returning(move |_| Ok(fitted(predictor, p, p)));
    mock.expect_name().return_const("mock".to_string());
    mock
}

/// A mock whose every fit fails with `error`.
pub fn failing(error: FitError) -> MockFitter {
    let mut mock = MockFitter::new();
    mock.expect_fit().returning(move |_| Err(error.clone()));
    mock.expect_name().return_const("mock".to_string());
    mock
}
