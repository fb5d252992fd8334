//! Integration tests: the full sample -> fit -> extract -> summarize
//! pipeline against the built-in fitter and a mocked one.

mod mock_fitter;
mod simulation;
