use serde::Serialize;

use super::eval::{EvalError, EvalErrorKind};

/// An expression operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Op {
    // Arithmetic.
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    // Stack manipulation.
    Dup,
    Swap,
    Drop,
    Over,
    /// Array decompose: pops the last element off the top array and
    /// pushes the shortened array, then the element.
    PopTail,
    /// Array compose: pops a value and an array, appends the value.
    PushTail,
    // Comparison and logic. Booleans are `1.0`/`0.0`.
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
    Not,
    // Trigonometry, in turns: `COS` computes `cos(2πx)`.
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    // Numeric helpers.
    Sqrt,
    Log,
    Ln,
    Abs,
    Floor,
    Ceil,
    Round,
    Min,
    Max,
    Neg,
    /// Cubic polynomial: pops the variable, then the coefficients
    /// lowest-degree first (they were pushed highest-degree first).
    Poly3,
    /// Array constructor building a fixed-size array from the top N
    /// stack values, oldest pushed at index 0.
    Array(usize),
    /// Empty-map constructor.
    MapNew,
    /// Map lookup: pops a key and a map, pushes the entry value.
    Get,
    /// Map insert: pops a key, a value, and a map, pushes the updated
    /// map.
    Put,
    // Real-time-clock queries.
    RtcYear,
    RtcMonthOfYear,
    RtcDayOfMonth,
    RtcDayOfWeek,
    RtcTimeOfDay,
    RtcAlignedWeekOfMonth,
    RtcWeekOfMonth,
    RtcWeekOfYear,
    /// Switches week numbering to Sunday-start for the rest of this
    /// evaluation.
    RtcWeekStartsSunday,
    /// Switches clock queries to the UTC snapshot for the rest of this
    /// evaluation.
    RtcUtc,
    /// Hours to seconds.
    HoursToSeconds,
    /// Days to seconds.
    DaysToSeconds,
    // Evaluation history.
    /// The current input value.
    Value,
    /// The previous input value.
    PrevValue,
    /// The fire count.
    Count,
}

impl Op {
    pub(super) fn from_word(word: &str) -> Option<Self> {
        Some(match word {
            "+" => Self::Add,
            "-" => Self::Sub,
            "*" => Self::Mul,
            "/" => Self::Div,
            "%" => Self::Rem,
            "^" => Self::Pow,
            "DUP" => Self::Dup,
            "SWAP" => Self::Swap,
            "DROP" => Self::Drop,
            "OVER" => Self::Over,
            "POP" => Self::PopTail,
            "PUSH" => Self::PushTail,
            "==" => Self::Eq,
            "!=" => Self::Ne,
            "<" => Self::Lt,
            ">" => Self::Gt,
            "<=" => Self::Le,
            ">=" => Self::Ge,
            "&&" => Self::And,
            "||" => Self::Or,
            "!" => Self::Not,
            "SIN" => Self::Sin,
            "COS" => Self::Cos,
            "TAN" => Self::Tan,
            "ASIN" => Self::Asin,
            "ACOS" => Self::Acos,
            "ATAN" => Self::Atan,
            "SQRT" => Self::Sqrt,
            "LOG" => Self::Log,
            "LN" => Self::Ln,
            "ABS" => Self::Abs,
            "FLOOR" => Self::Floor,
            "CEIL" => Self::Ceil,
            "ROUND" => Self::Round,
            "MIN" => Self::Min,
            "MAX" => Self::Max,
            "NEG" => Self::Neg,
            "POLY3" => Self::Poly3,
            "[]" => Self::Array(0),
            "[1]" => Self::Array(1),
            "[2]" => Self::Array(2),
            "[3]" => Self::Array(3),
            "[4]" => Self::Array(4),
            "{}" => Self::MapNew,
            "GET" => Self::Get,
            "PUT" => Self::Put,
            "rtc.y" => Self::RtcYear,
            "rtc.moy" => Self::RtcMonthOfYear,
            "rtc.dom" => Self::RtcDayOfMonth,
            "rtc.dow" => Self::RtcDayOfWeek,
            "rtc.tod" => Self::RtcTimeOfDay,
            "rtc.awm" => Self::RtcAlignedWeekOfMonth,
            "rtc.wom" => Self::RtcWeekOfMonth,
            "rtc.woy" => Self::RtcWeekOfYear,
            "rtc.wss" => Self::RtcWeekStartsSunday,
            "rtc.utc" => Self::RtcUtc,
            "H>S" => Self::HoursToSeconds,
            "D>S" => Self::DaysToSeconds,
            "v" => Self::Value,
            "v_l" => Self::PrevValue,
            "c" => Self::Count,
            _ => return None,
        })
    }

    /// Returns the source word of this operator.
    #[must_use]
    pub fn word(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
            Self::Pow => "^",
            Self::Dup => "DUP",
            Self::Swap => "SWAP",
            Self::Drop => "DROP",
            Self::Over => "OVER",
            Self::PopTail => "POP",
            Self::PushTail => "PUSH",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Ge => ">=",
            Self::And => "&&",
            Self::Or => "||",
            Self::Not => "!",
            Self::Sin => "SIN",
            Self::Cos => "COS",
            Self::Tan => "TAN",
            Self::Asin => "ASIN",
            Self::Acos => "ACOS",
            Self::Atan => "ATAN",
            Self::Sqrt => "SQRT",
            Self::Log => "LOG",
            Self::Ln => "LN",
            Self::Abs => "ABS",
            Self::Floor => "FLOOR",
            Self::Ceil => "CEIL",
            Self::Round => "ROUND",
            Self::Min => "MIN",
            Self::Max => "MAX",
            Self::Neg => "NEG",
            Self::Poly3 => "POLY3",
            Self::Array(0) => "[]",
            Self::Array(1) => "[1]",
            Self::Array(2) => "[2]",
            Self::Array(3) => "[3]",
            Self::Array(_) => "[4]",
            Self::MapNew => "{}",
            Self::Get => "GET",
            Self::Put => "PUT",
            Self::RtcYear => "rtc.y",
            Self::RtcMonthOfYear => "rtc.moy",
            Self::RtcDayOfMonth => "rtc.dom",
            Self::RtcDayOfWeek => "rtc.dow",
            Self::RtcTimeOfDay => "rtc.tod",
            Self::RtcAlignedWeekOfMonth => "rtc.awm",
            Self::RtcWeekOfMonth => "rtc.wom",
            Self::RtcWeekOfYear => "rtc.woy",
            Self::RtcWeekStartsSunday => "rtc.wss",
            Self::RtcUtc => "rtc.utc",
            Self::HoursToSeconds => "H>S",
            Self::DaysToSeconds => "D>S",
            Self::Value => "v",
            Self::PrevValue => "v_l",
            Self::Count => "c",
        }
    }
}

/// A single expression token.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// A numeric literal.
    Number(f64),
    /// A map-key literal (`:name`).
    Key(String),
    /// An operator.
    Op(Op),
    /// Conditional entry: pops the condition, skips the non-taken
    /// branch.
    If,
    /// Conditional alternative.
    Else,
    /// Conditional exit.
    EndIf,
    /// An unrecognized word.
    ///
    /// Kept through parsing so that a stored program fails soft, per
    /// evaluation cycle, instead of poisoning configuration load.
    Word(String),
}

impl Token {
    pub(super) fn text(&self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::Key(key) => format!(":{key}"),
            Self::Op(op) => op.word().to_string(),
            Self::If => "IF".into(),
            Self::Else => "ELSE".into(),
            Self::EndIf => "ENDIF".into(),
            Self::Word(word) => word.clone(),
        }
    }
}

/// An immutable automation-expression program.
///
/// Evaluation never mutates the program; all evaluation state lives in
/// the transient context built per [`evaluate`](Expression::evaluate)
/// call.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    pub(super) tokens: Vec<Token>,
}

impl PartialEq for Expression {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Expression {
    /// Parses a program from whitespace-separated source text.
    ///
    /// Numeric literals and `IF`/`ELSE`/`ENDIF` nesting are validated
    /// here; unrecognized words are kept and surface as
    /// [`EvalErrorKind::UnknownToken`] at evaluation time.
    ///
    /// # Errors
    ///
    /// Returns an [`EvalError`] when the conditional structure is
    /// unbalanced.
    pub fn parse(source: &str) -> Result<Self, EvalError> {
        let mut tokens = Vec::new();
        // Conditional nesting: (depth, saw-ELSE) per open IF.
        let mut conditions: Vec<bool> = Vec::new();

        for word in source.split_whitespace() {
            let token = match word {
                "IF" => {
                    conditions.push(false);
                    Token::If
                }
                "ELSE" => {
                    match conditions.last_mut() {
                        Some(saw_else) if !*saw_else => *saw_else = true,
                        _ => {
                            return Err(EvalError::new(
                                EvalErrorKind::UnbalancedCondition,
                                word,
                                0,
                            ));
                        }
                    }
                    Token::Else
                }
                "ENDIF" => {
                    if conditions.pop().is_none() {
                        return Err(EvalError::new(EvalErrorKind::UnbalancedCondition, word, 0));
                    }
                    Token::EndIf
                }
                _ => {
                    if let Some(key) = word.strip_prefix(':') {
                        Token::Key(key.to_string())
                    } else if let Ok(number) = word.parse::<f64>() {
                        Token::Number(number)
                    } else if let Some(op) = Op::from_word(word) {
                        Token::Op(op)
                    } else {
                        Token::Word(word.to_string())
                    }
                }
            };
            tokens.push(token);
        }

        if !conditions.is_empty() {
            return Err(EvalError::new(EvalErrorKind::UnbalancedCondition, "IF", 0));
        }

        Ok(Self {
            source: source.to_string(),
            tokens,
        })
    }

    /// Returns the program source text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Checks whether the program is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl std::fmt::Display for Expression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.source.fmt(f)
    }
}

impl Serialize for Expression {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.source)
    }
}

#[cfg(feature = "deserialize")]
impl<'de> serde::Deserialize<'de> for Expression {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let source = <String as serde::Deserialize>::deserialize(deserializer)?;
        Self::parse(&source).map_err(serde::de::Error::custom)
    }
}
