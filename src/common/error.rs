use thiserror::Error;

/// A violated IR invariant. This always indicates a bug in the compiler, not
/// in the compiled program: some transformation left the module in a state
/// the data model forbids.
///
/// The validator attaches the printed declaration of the offending value and
/// the enclosing function in textual IR form so the broken module can be
/// inspected without a debugger.
#[derive(Debug, Error)]
#[error("IR invariant violated: {message}\n\t{value_decl}\n{function_dump}")]
pub struct InvariantError {
    /// Short explanation of which invariant was violated.
    pub message: String,
    /// Printed declaration of the violating value, block, or type.
    pub value_decl: String,
    /// The enclosing function printed in IR form, or empty for module-level
    /// violations.
    pub function_dump: String,
}

impl InvariantError {
    pub fn new(
        message: impl Into<String>,
        value_decl: impl Into<String>,
        function_dump: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            value_decl: value_decl.into(),
            function_dump: function_dump.into(),
        }
    }

    /// Reports the violation and panics. When `SC_REPORT_INVARIANT_VIOLATIONS`
    /// is set in the environment the full function dump is written to stderr
    /// first.
    pub fn report(self) -> ! {
        if std::env::var_os("SC_REPORT_INVARIANT_VIOLATIONS").is_some() {
            eprintln!("{self}");
        }
        panic!("IR invariant violated: {}", self.message);
    }
}

pub type ValidationResult = Result<(), Box<InvariantError>>;
