use crate::runtime::{Error, RuntimeConnection};
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use strum_macros::{Display, EnumIter};

/// Frame of a `T` stack trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub index: usize,
    /// Subroutine call as printed by the debugger, e.g. `main::foo('a', 1)`.
    pub sub: String,
    /// Caller file.
    pub file: String,
    /// Caller line.
    pub line: u32,
}

impl StackFrame {
    /// Subroutine name without call arguments.
    pub fn sub_name(&self) -> &str {
        match self.sub.find('(') {
            Some(pos) if pos > 0 => &self.sub[..pos],
            _ => &self.sub,
        }
    }
}

/// Variable scopes presented to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
pub enum Scope {
    /// `my` and `our` variables visible at the current position (requires PadWalker).
    Lexical,
    /// Globals of the current package.
    Package,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
    pub value: String,
}

static FRAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*[.$@] = (?P<sub>.+?) called from file '(?P<file>.+?)' line (?P<line>\d+)\s*$")
        .expect("must compile")
});

static LEXICAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(?P<name>[$@%][\w:]+) = ").expect("must compile"));

/// Parse `T` output. Lines that are not frames are skipped.
pub(crate) fn parse_stack_trace(reply: &str) -> Vec<StackFrame> {
    reply
        .lines()
        .filter_map(|line| {
            let caps = FRAME_RE.captures(line)?;
            Some((
                caps["sub"].to_string(),
                caps["file"].to_string(),
                caps["line"].parse::<u32>().ok()?,
            ))
        })
        .enumerate()
        .map(|(index, (sub, file, line))| StackFrame {
            index,
            sub,
            file,
            line,
        })
        .collect()
}

/// Variable names from `y` output.
pub(crate) fn parse_lexical_names(reply: &str) -> Vec<String> {
    LEXICAL_RE
        .captures_iter(reply)
        .map(|caps| caps["name"].to_string())
        .unique()
        .collect()
}

pub(crate) fn parse_name_list(reply: &str) -> Vec<String> {
    reply
        .trim()
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(ToString::to_string)
        .collect()
}

const PACKAGE_VARIABLES: &str = r#"p do { no strict 'refs'; no warnings; my $p = $DB::package; join ',', map { my $g = "${p}::$_"; (defined ${*{$g}{SCALAR}} ? "\$$_" : (), *{$g}{ARRAY} ? "\@$_" : (), *{$g}{HASH} ? "%$_" : ()) } grep { /^[A-Za-z_]\w*$/ && !/^(?:ENV|INC|ARGV|ARGVOUT|SIG|STDIN|STDOUT|STDERR|BEGIN|END|a|b|_)$/ } sort keys %{"${p}::"} }"#;

/// Debugger command that prints an expression value.
#[derive(Debug, PartialEq, Eq)]
enum Evaluation {
    /// Scalar that may hold a reference, `ref` is checked first.
    Scalar(String),
    /// Dump with `x`.
    Dump(String),
}

fn plan_evaluation(expr: &str) -> Evaluation {
    let expr = expr.strip_prefix('"').unwrap_or(expr);
    let expr = expr.strip_suffix('"').unwrap_or(expr);

    match expr.chars().next() {
        Some('$') => Evaluation::Scalar(expr.to_string()),
        Some('@' | '%' | '&' | '*') => Evaluation::Dump(format!("\\{expr}")),
        Some('\\') => Evaluation::Dump(expr.to_string()),
        // a hash is the most common name without sigil in client requests
        _ => Evaluation::Dump(format!("\\%{expr}")),
    }
}

impl RuntimeConnection {
    /// Call stack of the debuggee (`T`).
    pub fn get_stack_trace(&self) -> Result<Vec<StackFrame>, Error> {
        Ok(parse_stack_trace(&self.run_command("T")?))
    }

    /// Variables of a scope, empty if PadWalker is not installed.
    pub fn get_variables(&self, scope: Scope) -> Result<Vec<Variable>, Error> {
        if !self.introspection_installed()? {
            return Ok(vec![]);
        }

        let names = match scope {
            Scope::Lexical => parse_lexical_names(&self.run_command("y")?),
            Scope::Package => parse_name_list(&self.run_command(PACKAGE_VARIABLES)?),
        };

        names
            .into_iter()
            .map(|name| {
                let value = self.evaluate_variable(&name)?;
                Ok(Variable { name, value })
            })
            .collect()
    }

    /// Print a variable, expression without a sigil is considered as a hash name.
    pub fn evaluate_variable(&self, expr: &str) -> Result<String, Error> {
        match plan_evaluation(expr) {
            Evaluation::Scalar(var) => {
                let reference = self.run_command(&format!("p ref {var}"))?;
                if reference.trim().is_empty() {
                    self.run_command(&format!("p {var}"))
                } else {
                    self.run_command(&format!("x {var}"))
                }
            }
            Evaluation::Dump(expr) => self.run_command(&format!("x {expr}")),
        }
    }

    /// Assign a new value and return the updated one.
    pub fn set_variable(&self, name: &str, value: &str) -> Result<String, Error> {
        self.run_command(&format!("{name} = {value}"))?;
        self.evaluate_variable(name)
    }
}
