//! The automation expression language.
//!
//! A minimal, stack-based (RPN) language used by pairing transforms,
//! rule conditions, and timer schedules. Programs are whitespace
//! separated token sequences evaluated left to right against an
//! explicit value stack; all numbers are `f64` and booleans read as
//! `1.0`/`0.0`.
//!
//! Programs are user authored and untrusted: every malformed program
//! fails with an [`EvalError`] carrying the offending token and the
//! stack depth at the failure point. Evaluation never panics.
//!
//! ```
//! use filament::expr::{EvalEnv, Expression};
//! use filament::value::Value;
//!
//! let program = Expression::parse("5 3 +").unwrap();
//! let result = program.evaluate(&EvalEnv::fixed()).unwrap();
//!
//! assert_eq!(result, Some(Value::Number(8.0)));
//! ```

mod eval;
mod rtc;
mod token;

pub use eval::{EvalEnv, EvalError, EvalErrorKind};
pub use rtc::RtcSnapshot;
pub use token::{Expression, Op, Token};
