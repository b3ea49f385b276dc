//! Execution labels: deterministic rendering of scoped call arguments.
//!
//! ```text
//! label     := name "(" args ")"
//! args      := arg ("," arg)*
//! arg       := paramName "=" jsonValue
//! fullLabel := ancestorFullLabel "." label
//! ```

use serde::Serialize;
use serde_json::Value;

/// A named argument of a scoped function, identified by its declared position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeParam {
    /// Declared position of the argument
    pub index: usize,
    /// Name rendered into the label
    pub name: String,
}

impl ScopeParam {
    /// Create a new parameter description.
    pub fn new(index: usize, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
        }
    }
}

/// Render arguments as `name=json,...`, ordered by declared index.
///
/// Arguments without a declared parameter are not rendered; declared
/// parameters past the end of `args` render as `null`.
pub fn format_scope_params(args: &[Value], params: &[ScopeParam]) -> String {
    let mut params: Vec<&ScopeParam> = params.iter().collect();
    params.sort_by_key(|p| p.index);
    params
        .iter()
        .map(|p| {
            let value = args.get(p.index).unwrap_or(&Value::Null);
            format!("{}={}", p.name, value)
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// `name(args)`
pub fn execution_label(name: &str, formatted_args: &str) -> String {
    format!("{}({})", name, formatted_args)
}

/// Arguments of a scoped call that can be rendered into an execution label.
pub trait ScopeArgs {
    /// JSON values of the arguments in declared order.
    fn to_values(&self) -> Vec<Value>;
}

impl ScopeArgs for () {
    fn to_values(&self) -> Vec<Value> {
        Vec::new()
    }
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

macro_rules! impl_scope_args {
    ($($name:ident : $idx:tt),+) => {
        impl<$($name: Serialize),+> ScopeArgs for ($($name,)+) {
            fn to_values(&self) -> Vec<Value> {
                vec![$(to_json(&self.$idx)),+]
            }
        }
    };
}

impl_scope_args!(A: 0);
impl_scope_args!(A: 0, B: 1);
impl_scope_args!(A: 0, B: 1, C: 2);
impl_scope_args!(A: 0, B: 1, C: 2, D: 3);
impl_scope_args!(A: 0, B: 1, C: 2, D: 3, E: 4);
