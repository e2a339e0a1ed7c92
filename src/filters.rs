//! Ordered middleware chains.
//!
//! A [`FilterChain`] wraps a core operation with an explicit, ordered list
//! of stages. Each stage receives the context plus a continuation and must
//! forward to it (or short-circuit deliberately); the core runs when the
//! last stage forwards. Backends use this to let callers inspect or rewrite
//! rendered commands before execution.

/// One middleware stage: context in, continuation to forward to.
pub type Stage<T, R> = Box<dyn Fn(T, &mut dyn FnMut(T) -> R) -> R + Send + Sync>;

/// An ordered middleware list invoked around a core operation.
pub struct FilterChain<T, R> {
    stages: Vec<Stage<T, R>>,
}

impl<T, R> Default for FilterChain<T, R> {
    fn default() -> Self {
        Self { stages: Vec::new() }
    }
}

impl<T, R> FilterChain<T, R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage; stages run in insertion order, outermost first.
    pub fn push<F>(&mut self, stage: F) -> &mut Self
    where
        F: Fn(T, &mut dyn FnMut(T) -> R) -> R + Send + Sync + 'static,
    {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Run the chain around `core`.
    pub fn run(&self, input: T, core: &mut dyn FnMut(T) -> R) -> R {
        self.run_from(0, input, core)
    }

    fn run_from(&self, index: usize, input: T, core: &mut dyn FnMut(T) -> R) -> R {
        match self.stages.get(index) {
            None => core(input),
            Some(stage) => stage(input, &mut |value| self.run_from(index + 1, value, &mut *core)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stages_wrap_in_order() {
        let mut chain: FilterChain<String, String> = FilterChain::new();
        chain.push(|input, next| format!("a({})", next(format!("{input}+a"))));
        chain.push(|input, next| format!("b({})", next(format!("{input}+b"))));
        let out = chain.run("x".to_string(), &mut |input| format!("core[{input}]"));
        assert_eq!(out, "a(b(core[x+a+b]))");
    }

    #[test]
    fn test_stage_may_short_circuit() {
        let mut chain: FilterChain<i32, i32> = FilterChain::new();
        chain.push(|input, next| if input < 0 { -1 } else { next(input) });
        assert_eq!(chain.run(-5, &mut |n| n * 2), -1);
        assert_eq!(chain.run(5, &mut |n| n * 2), 10);
    }

    #[test]
    fn test_empty_chain_runs_core() {
        let chain: FilterChain<i32, i32> = FilterChain::new();
        assert_eq!(chain.run(3, &mut |n| n + 1), 4);
    }
}
