//! Step instructions rendering.
//!
//! `instructions` in a template is a minijinja template rendered against
//! `{run_id, step_id, attempt, state}` right before the hook runs.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

pub fn render_instructions(
    source: &str,
    run_id: &str,
    step_id: &str,
    attempt: u32,
    state: &impl Serialize,
) -> Result<String> {
    let env = Environment::new();
    env.render_str(
        source,
        context! {
            run_id => run_id,
            step_id => step_id,
            attempt => attempt,
            state => state,
        },
    )
    .with_context(|| format!("render instructions for step '{step_id}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_state_paths() {
        let state = json!({"reward": {"latest": {"reward_total": 0.5}}});
        let out = render_instructions(
            "Attempt {{ attempt }} of {{ step_id }}{% if state.reward.latest %}: last score {{ state.reward.latest.reward_total }}{% endif %}",
            "r1",
            "impl",
            2,
            &state,
        )
        .expect("render");
        assert_eq!(out, "Attempt 2 of impl: last score 0.5");
    }

    #[test]
    fn syntax_errors_name_the_step() {
        let err = render_instructions("{% if %}", "r1", "impl", 1, &json!({})).unwrap_err();
        assert!(err.to_string().contains("impl"));
    }
}
