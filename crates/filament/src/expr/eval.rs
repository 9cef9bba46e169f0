use std::f64::consts::TAU;

use crate::value::{Map, Value};

use super::rtc::RtcSnapshot;
use super::token::{Expression, Op, Token};

/// All possible evaluation failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalErrorKind {
    /// The program contains a word that is not an operator.
    UnknownToken,
    /// An operator needed more operands than the stack holds.
    StackUnderflow,
    /// An operand had the wrong type for its operator.
    TypeMismatch,
    /// Division or remainder by zero.
    DivisionByZero,
    /// The program read `v` or `v_l` without an input value.
    MissingInput,
    /// A map lookup named a missing key.
    MissingKey,
    /// `IF`/`ELSE`/`ENDIF` structure is unbalanced.
    UnbalancedCondition,
}

impl EvalErrorKind {
    const fn description(self) -> &'static str {
        match self {
            Self::UnknownToken => "unknown token",
            Self::StackUnderflow => "stack underflow",
            Self::TypeMismatch => "type mismatch",
            Self::DivisionByZero => "division by zero",
            Self::MissingInput => "missing input value",
            Self::MissingKey => "missing map key",
            Self::UnbalancedCondition => "unbalanced condition",
        }
    }
}

/// An expression evaluation failure.
///
/// Carries the offending token and the stack depth at the failure
/// point. Programs are user authored, so these are routine runtime
/// events: callers log them and treat the cycle as "no propagation".
#[derive(Debug, Clone, PartialEq)]
pub struct EvalError {
    /// The failure kind.
    pub kind: EvalErrorKind,
    /// The token being executed when evaluation failed.
    pub token: String,
    /// The stack depth at the failure point.
    pub stack_depth: usize,
}

impl EvalError {
    pub(super) fn new(kind: EvalErrorKind, token: impl Into<String>, stack_depth: usize) -> Self {
        Self {
            kind,
            token: token.into(),
            stack_depth,
        }
    }
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at `{}` (stack depth {})",
            self.kind.description(),
            self.token,
            self.stack_depth
        )
    }
}

impl std::error::Error for EvalError {}

/// The environment an expression evaluates against.
///
/// Supplies the current and previous input values, the fire count, and
/// real-time-clock snapshots. Evaluation reads the environment but
/// never mutates it; the `rtc.wss` and `rtc.utc` operators change only
/// the transient context of a single evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalEnv {
    /// The current input value, preloaded onto the stack.
    pub value: Option<Value>,
    /// The previous input value, read by `v_l`.
    pub prev_value: Option<Value>,
    /// The fire count, read by `c`.
    pub count: u64,
    /// The local-zone clock snapshot.
    pub rtc: RtcSnapshot,
    /// The UTC clock snapshot, selected by `rtc.utc`.
    pub rtc_utc: RtcSnapshot,
    /// Whether weeks start on Sunday by default.
    pub week_starts_sunday: bool,
}

impl Default for EvalEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl EvalEnv {
    /// Creates an environment snapshotting the current wall clock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            value: None,
            prev_value: None,
            count: 0,
            rtc: RtcSnapshot::now_local(),
            rtc_utc: RtcSnapshot::now_utc(),
            week_starts_sunday: false,
        }
    }

    /// Creates an environment with a fixed epoch clock.
    ///
    /// Deterministic; meant for tests and documentation examples.
    #[must_use]
    pub fn fixed() -> Self {
        let epoch = RtcSnapshot::from_datetime(&chrono::DateTime::UNIX_EPOCH.naive_utc());
        Self {
            value: None,
            prev_value: None,
            count: 0,
            rtc: epoch,
            rtc_utc: epoch,
            week_starts_sunday: false,
        }
    }

    /// Sets the current input value.
    #[must_use]
    pub fn value(mut self, value: impl Into<Value>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Sets the previous input value.
    #[must_use]
    pub fn prev_value(mut self, prev_value: impl Into<Value>) -> Self {
        self.prev_value = Some(prev_value.into());
        self
    }

    /// Sets the fire count.
    #[must_use]
    pub const fn count(mut self, count: u64) -> Self {
        self.count = count;
        self
    }

    /// Sets both clock snapshots.
    #[must_use]
    pub const fn rtc(mut self, local: RtcSnapshot, utc: RtcSnapshot) -> Self {
        self.rtc = local;
        self.rtc_utc = utc;
        self
    }

    /// Sets the default week start to Sunday.
    #[must_use]
    pub const fn week_starts_sunday(mut self) -> Self {
        self.week_starts_sunday = true;
        self
    }
}

// Transient evaluation state. Lives for one `evaluate` call.
struct Ctx<'env> {
    stack: Vec<Value>,
    env: &'env EvalEnv,
    week_starts_sunday: bool,
    utc: bool,
}

impl Ctx<'_> {
    fn rtc(&self) -> &RtcSnapshot {
        if self.utc { &self.env.rtc_utc } else { &self.env.rtc }
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self, token: &Token) -> Result<Value, EvalError> {
        self.stack
            .pop()
            .ok_or_else(|| EvalError::new(EvalErrorKind::StackUnderflow, token.text(), 0))
    }

    fn pop_number(&mut self, token: &Token) -> Result<f64, EvalError> {
        let value = self.pop(token)?;
        value.as_f64().ok_or_else(|| {
            EvalError::new(EvalErrorKind::TypeMismatch, token.text(), self.stack.len())
        })
    }

    fn pop_array(&mut self, token: &Token) -> Result<Vec<Value>, EvalError> {
        match self.pop(token)? {
            Value::Array(values) => Ok(values),
            _ => Err(EvalError::new(
                EvalErrorKind::TypeMismatch,
                token.text(),
                self.stack.len(),
            )),
        }
    }

    fn pop_map(&mut self, token: &Token) -> Result<Map, EvalError> {
        match self.pop(token)? {
            Value::Map(entries) => Ok(entries),
            _ => Err(EvalError::new(
                EvalErrorKind::TypeMismatch,
                token.text(),
                self.stack.len(),
            )),
        }
    }

    fn pop_key(&mut self, token: &Token) -> Result<String, EvalError> {
        match self.pop(token)? {
            Value::Text(key) => Ok(key),
            _ => Err(EvalError::new(
                EvalErrorKind::TypeMismatch,
                token.text(),
                self.stack.len(),
            )),
        }
    }
}

// Booleans are 1.0/0.0 on the stack.
const fn truth(value: bool) -> f64 {
    if value { 1.0 } else { 0.0 }
}

fn value_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => a == b,
    }
}

// Returns the index of the matching `ELSE` or `ENDIF`, skipping nested
// conditionals.
fn skip_branch(tokens: &[Token], from: usize, to_endif_only: bool) -> Result<usize, EvalError> {
    let mut depth = 0usize;
    for (offset, token) in tokens[from + 1..].iter().enumerate() {
        match token {
            Token::If => depth += 1,
            Token::Else if depth == 0 && !to_endif_only => return Ok(from + 1 + offset),
            Token::EndIf => {
                if depth == 0 {
                    return Ok(from + 1 + offset);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    Err(EvalError::new(EvalErrorKind::UnbalancedCondition, "IF", 0))
}

impl Expression {
    /// Evaluates the program against the given environment.
    ///
    /// The current input value, when present, is preloaded onto the
    /// stack. The result is the top of the stack after full
    /// consumption; an empty stack is the defined "no propagation"
    /// signal and yields `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns an [`EvalError`] on unknown tokens, stack underflow,
    /// operand type mismatches, and division by zero.
    pub fn evaluate(&self, env: &EvalEnv) -> Result<Option<Value>, EvalError> {
        let mut ctx = Ctx {
            stack: Vec::new(),
            env,
            week_starts_sunday: env.week_starts_sunday,
            utc: false,
        };

        if let Some(value) = &env.value {
            ctx.push(value.clone());
        }

        let tokens = &self.tokens;
        let mut i = 0;
        while i < tokens.len() {
            let token = &tokens[i];
            match token {
                Token::Number(n) => ctx.push(Value::Number(*n)),
                Token::Key(key) => ctx.push(Value::Text(key.clone())),
                Token::If => {
                    let condition = ctx.pop(token)?;
                    if !condition.is_truthy() {
                        i = skip_branch(tokens, i, false)?;
                    }
                }
                // Reached only after the taken branch ran.
                Token::Else => i = skip_branch(tokens, i, true)?,
                Token::EndIf => {}
                Token::Word(word) => {
                    return Err(EvalError::new(
                        EvalErrorKind::UnknownToken,
                        word.clone(),
                        ctx.stack.len(),
                    ));
                }
                Token::Op(op) => step(&mut ctx, *op, token)?,
            }
            i += 1;
        }

        Ok(ctx.stack.pop())
    }
}

#[allow(clippy::too_many_lines)]
fn step(ctx: &mut Ctx<'_>, op: Op, token: &Token) -> Result<(), EvalError> {
    match op {
        Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Rem | Op::Pow | Op::Min | Op::Max => {
            let b = ctx.pop_number(token)?;
            let a = ctx.pop_number(token)?;
            let result = match op {
                Op::Add => a + b,
                Op::Sub => a - b,
                Op::Mul => a * b,
                Op::Div | Op::Rem => {
                    if b == 0.0 {
                        return Err(EvalError::new(
                            EvalErrorKind::DivisionByZero,
                            token.text(),
                            ctx.stack.len(),
                        ));
                    }
                    if op == Op::Div { a / b } else { a % b }
                }
                Op::Pow => a.powf(b),
                Op::Min => a.min(b),
                _ => a.max(b),
            };
            ctx.push(Value::Number(result));
        }
        Op::Lt | Op::Gt | Op::Le | Op::Ge => {
            let b = ctx.pop_number(token)?;
            let a = ctx.pop_number(token)?;
            let result = match op {
                Op::Lt => a < b,
                Op::Gt => a > b,
                Op::Le => a <= b,
                _ => a >= b,
            };
            ctx.push(Value::Number(truth(result)));
        }
        Op::Eq | Op::Ne => {
            let b = ctx.pop(token)?;
            let a = ctx.pop(token)?;
            let equal = value_eq(&a, &b);
            ctx.push(Value::Number(truth(if op == Op::Eq { equal } else { !equal })));
        }
        Op::And | Op::Or => {
            let b = ctx.pop_number(token)? >= 0.5;
            let a = ctx.pop_number(token)? >= 0.5;
            let result = if op == Op::And { a && b } else { a || b };
            ctx.push(Value::Number(truth(result)));
        }
        Op::Not => {
            let a = ctx.pop_number(token)? >= 0.5;
            ctx.push(Value::Number(truth(!a)));
        }
        Op::Sin | Op::Cos | Op::Tan | Op::Asin | Op::Acos | Op::Atan | Op::Sqrt | Op::Log
        | Op::Ln | Op::Abs | Op::Floor | Op::Ceil | Op::Round | Op::Neg | Op::HoursToSeconds
        | Op::DaysToSeconds => {
            let x = ctx.pop_number(token)?;
            let result = match op {
                // Trigonometry operates in turns, not radians.
                Op::Sin => (x * TAU).sin(),
                Op::Cos => (x * TAU).cos(),
                Op::Tan => (x * TAU).tan(),
                Op::Asin => x.asin() / TAU,
                Op::Acos => x.acos() / TAU,
                Op::Atan => x.atan() / TAU,
                Op::Sqrt => x.sqrt(),
                Op::Log => x.log10(),
                Op::Ln => x.ln(),
                Op::Abs => x.abs(),
                Op::Floor => x.floor(),
                Op::Ceil => x.ceil(),
                Op::Round => x.round(),
                Op::Neg => -x,
                Op::HoursToSeconds => x * 3600.0,
                _ => x * 86400.0,
            };
            ctx.push(Value::Number(result));
        }
        Op::Dup => {
            let a = ctx.pop(token)?;
            ctx.push(a.clone());
            ctx.push(a);
        }
        Op::Swap => {
            let b = ctx.pop(token)?;
            let a = ctx.pop(token)?;
            ctx.push(b);
            ctx.push(a);
        }
        Op::Drop => {
            ctx.pop(token)?;
        }
        Op::Over => {
            let b = ctx.pop(token)?;
            let a = ctx.pop(token)?;
            ctx.push(a.clone());
            ctx.push(b);
            ctx.push(a);
        }
        Op::PopTail => {
            let mut values = ctx.pop_array(token)?;
            let Some(tail) = values.pop() else {
                return Err(EvalError::new(
                    EvalErrorKind::TypeMismatch,
                    token.text(),
                    ctx.stack.len(),
                ));
            };
            ctx.push(Value::Array(values));
            ctx.push(tail);
        }
        Op::PushTail => {
            let value = ctx.pop(token)?;
            let mut values = ctx.pop_array(token)?;
            values.push(value);
            ctx.push(Value::Array(values));
        }
        Op::Poly3 => {
            let n = ctx.pop_number(token)?;
            let d = ctx.pop_number(token)?;
            let c = ctx.pop_number(token)?;
            let b = ctx.pop_number(token)?;
            let a = ctx.pop_number(token)?;
            ctx.push(Value::Number(a * n.powi(3) + b * n.powi(2) + c * n + d));
        }
        Op::Array(len) => {
            if ctx.stack.len() < len {
                return Err(EvalError::new(
                    EvalErrorKind::StackUnderflow,
                    token.text(),
                    ctx.stack.len(),
                ));
            }
            // Push order preserved: the oldest pushed value lands at
            // index 0.
            let values = ctx.stack.split_off(ctx.stack.len() - len);
            ctx.push(Value::Array(values));
        }
        Op::MapNew => ctx.push(Value::Map(Map::new())),
        Op::Get => {
            let key = ctx.pop_key(token)?;
            let entries = ctx.pop_map(token)?;
            let Some(value) = entries.get(&key) else {
                return Err(EvalError::new(
                    EvalErrorKind::MissingKey,
                    token.text(),
                    ctx.stack.len(),
                ));
            };
            ctx.push(value.clone());
        }
        Op::Put => {
            let key = ctx.pop_key(token)?;
            let value = ctx.pop(token)?;
            let mut entries = ctx.pop_map(token)?;
            entries.insert(key, value);
            ctx.push(Value::Map(entries));
        }
        Op::RtcYear => ctx.push(Value::Number(ctx.rtc().year())),
        Op::RtcMonthOfYear => ctx.push(Value::Number(ctx.rtc().month_of_year())),
        Op::RtcDayOfMonth => ctx.push(Value::Number(ctx.rtc().day_of_month())),
        Op::RtcDayOfWeek => {
            let dow = ctx.rtc().day_of_week(ctx.week_starts_sunday);
            ctx.push(Value::Number(dow));
        }
        Op::RtcTimeOfDay => ctx.push(Value::Number(ctx.rtc().time_of_day())),
        Op::RtcAlignedWeekOfMonth => ctx.push(Value::Number(ctx.rtc().aligned_week_of_month())),
        Op::RtcWeekOfMonth => {
            let wom = ctx.rtc().week_of_month(ctx.week_starts_sunday);
            ctx.push(Value::Number(wom));
        }
        Op::RtcWeekOfYear => ctx.push(Value::Number(ctx.rtc().week_of_year())),
        Op::RtcWeekStartsSunday => ctx.week_starts_sunday = true,
        Op::RtcUtc => ctx.utc = true,
        Op::Value => {
            let Some(value) = &ctx.env.value else {
                return Err(EvalError::new(
                    EvalErrorKind::MissingInput,
                    token.text(),
                    ctx.stack.len(),
                ));
            };
            ctx.push(value.clone());
        }
        Op::PrevValue => {
            let Some(value) = &ctx.env.prev_value else {
                return Err(EvalError::new(
                    EvalErrorKind::MissingInput,
                    token.text(),
                    ctx.stack.len(),
                ));
            };
            ctx.push(value.clone());
        }
        #[allow(clippy::cast_precision_loss)]
        Op::Count => ctx.push(Value::Number(ctx.env.count as f64)),
    }
    Ok(())
}
