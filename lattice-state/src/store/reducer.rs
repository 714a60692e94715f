//! The reducer seam.
//!
//! A reducer is supplied by the application: a pure function from the
//! current snapshot and an action to the next snapshot. It must not read or
//! write cells itself; every change flows back through `dispatch`.

use crate::error::BoxError;

use super::state::{Action, State};

/// Computes the next state for an action.
///
/// Keys left out of the returned snapshot are treated as unchanged, not
/// deleted. Returning an error aborts the dispatch with nothing written.
pub trait Reducer: Send + Sync + 'static {
    fn reduce(&self, state: &State, action: &Action) -> Result<State, BoxError>;
}

impl<F> Reducer for F
where
    F: Fn(&State, &Action) -> Result<State, BoxError> + Send + Sync + 'static,
{
    fn reduce(&self, state: &State, action: &Action) -> Result<State, BoxError> {
        self(state, action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Toggle;

    impl Reducer for Toggle {
        fn reduce(&self, state: &State, action: &Action) -> Result<State, BoxError> {
            match action.kind() {
                "TOGGLE" => {
                    let on = state.get("on").and_then(|v| v.as_bool()).unwrap_or(false);
                    Ok(state.with("on", !on))
                }
                other => Err(format!("unknown action `{other}`").into()),
            }
        }
    }

    #[test]
    fn struct_reducers_implement_the_trait() {
        let state: State = [("on", false)].into_iter().collect();
        let next = Toggle.reduce(&state, &Action::new("TOGGLE")).unwrap();
        assert_eq!(next.get("on").and_then(|v| v.as_bool()), Some(true));

        let err = Toggle.reduce(&state, &Action::new("EXPLODE")).unwrap_err();
        assert_eq!(err.to_string(), "unknown action `EXPLODE`");
    }
}
