//! Compilation context: limits and diagnostic configuration.

/// Hard limits applied during compilation of adversarial inputs.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Cap on generic function instantiations per compilation; 0 disables.
    pub max_generic_instantiations: u32,
    /// Cap on AST nodes accepted from a single source; 0 disables.
    pub max_ast_nodes: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_generic_instantiations: 256,
            max_ast_nodes: 0,
        }
    }
}

/// How much debug information compilation and traces carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebugLevel {
    /// No per-instruction source locations.
    None,
    /// Locations only; stack traces report line and column.
    Minimal,
    /// Locations plus source-line excerpts with caret markers.
    #[default]
    Full,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DiagnosticConfig {
    pub debug_level: DebugLevel,
}

/// Per-compilation context shared by the compiler and constant evaluator.
#[derive(Debug, Clone, Copy, Default)]
pub struct Context {
    pub limits: Limits,
    pub diagnostics: DiagnosticConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let ctx = Context::default();
        assert_eq!(ctx.limits.max_generic_instantiations, 256);
        assert_eq!(ctx.diagnostics.debug_level, DebugLevel::Full);
    }
}
