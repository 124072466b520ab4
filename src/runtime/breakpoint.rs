use crate::runtime::{lock, perl_quote, Error, RuntimeConnection};
use crate::muted_error;
use itertools::Itertools;
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

/// Physical breakpoint place, path is the one known by the debuggee.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Location {
    pub path: String,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub struct LineBreakpoint {
    pub location: Location,
    pub condition: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FunctionBreakpoint {
    pub name: String,
    pub location: Location,
    pub condition: Option<String>,
}

/// Resolved function breakpoint as reported to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionLocation {
    pub name: String,
    /// Client side path.
    pub path: String,
    pub line: u32,
}

/// Logical breakpoints of a single connection.
///
/// Line and function breakpoints may share a physical breakpoint, it must stay in the
/// debuggee until no logical breakpoint of either kind refers to it.
#[derive(Debug, Default)]
pub struct BreakpointRegistry {
    lines: Vec<LineBreakpoint>,
    functions: Vec<FunctionBreakpoint>,
}

impl BreakpointRegistry {
    pub fn add_line(&mut self, brkpt: LineBreakpoint) {
        self.lines.push(brkpt);
    }

    pub fn add_function(&mut self, brkpt: FunctionBreakpoint) {
        self.functions.push(brkpt);
    }

    pub fn lines(&self) -> &[LineBreakpoint] {
        &self.lines
    }

    pub fn functions(&self) -> &[FunctionBreakpoint] {
        &self.functions
    }

    fn referenced(&self, location: &Location) -> bool {
        self.lines.iter().any(|b| &b.location == location)
            || self.functions.iter().any(|b| &b.location == location)
    }

    /// Remove line breakpoints matching the predicate, return locations that no longer
    /// referenced by any breakpoint.
    pub fn take_lines(&mut self, mut predicate: impl FnMut(&Location) -> bool) -> Vec<Location> {
        let (removed, kept): (Vec<_>, Vec<_>) = self
            .lines
            .drain(..)
            .partition(|b| predicate(&b.location));
        self.lines = kept;
        self.unreferenced(removed.into_iter().map(|b| b.location))
    }

    /// Remove all function breakpoints, return locations that no longer referenced by any
    /// breakpoint.
    pub fn take_functions(&mut self) -> Vec<Location> {
        let removed = std::mem::take(&mut self.functions);
        self.unreferenced(removed.into_iter().map(|b| b.location))
    }

    fn unreferenced(&self, removed: impl Iterator<Item = Location>) -> Vec<Location> {
        removed
            .unique()
            .filter(|location| !self.referenced(location))
            .collect()
    }
}

static LISTING_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*(?P<line>\d+)(?P<arrow>==>|:| )(?P<brkpt>b?)a?\t").expect("must compile")
});

/// Find the breakpoint line in a `l <sub>` listing. Lines with a breakpoint are
/// marked with `b`, a breakable line is the second choice.
pub(crate) fn parse_listing_line(listing: &str) -> Option<u32> {
    let lines: Vec<_> = LISTING_LINE_RE
        .captures_iter(listing)
        .filter_map(|caps| {
            let line = caps["line"].parse::<u32>().ok()?;
            let breakable = &caps["arrow"] != " ";
            let has_brkpt = !caps["brkpt"].is_empty();
            Some((line, breakable, has_brkpt))
        })
        .collect();

    lines
        .iter()
        .find(|(_, _, has_brkpt)| *has_brkpt)
        .or_else(|| lines.iter().find(|(_, breakable, _)| *breakable))
        .or_else(|| lines.first())
        .map(|(line, _, _)| *line)
}

#[derive(Deserialize)]
struct SubLocation {
    file: String,
    line: u32,
}

fn locate_sub_command(name: &str) -> String {
    format!(
        "if (!$INC{{'B.pm'}}) {{ require B; $DB::perl_dap_required_b = 1; }} \
         $DB::perl_dap_cv = B::svref_2object(\\&{name}); \
         print {{$DB::OUT}} q[{{\"file\":\"].$DB::perl_dap_cv->FILE.q[\",\"line\":].$DB::perl_dap_cv->START->line.q[}}]; \
         undef $DB::perl_dap_cv; \
         if ($DB::perl_dap_required_b) {{ delete $INC{{'B.pm'}}; undef %B::; undef $DB::perl_dap_required_b }}"
    )
}

/// Breakpoint line of `b <name>`: the first breakable line from the subroutine start
/// recorded in `%DB::sub`, printed as `file:line`.
fn sub_entry_command(name: &str) -> String {
    format!(
        "p do {{ no strict 'refs'; no warnings; my $n = {name}; \
         $n = \"${{DB::package}}::$n\" if $n !~ /::/; \
         my ($f, $i) = ($DB::sub{{$n}} // '') =~ /^(.*):(\\d+)-\\d+$/; \
         my $l = \\@{{\"main::_<\" . ($f // '')}}; \
         ++$i while defined $f && ($$l[$i] // 0) == 0 && $i < $#$l; \
         defined $f ? \"$f:$i\" : '' }}",
        name = perl_quote(name),
    )
}

pub(crate) fn parse_sub_entry(reply: &str) -> Option<Location> {
    let (path, line) = reply.trim().rsplit_once(':')?;
    let line = line.parse().ok()?;
    (!path.is_empty()).then(|| Location {
        path: path.to_string(),
        line,
    })
}

/// Breakable line numbers from a comma separated list, limited to `[start, end]`.
pub(crate) fn parse_breakable_lines(reply: &str, start: u32, end: Option<u32>) -> Vec<u32> {
    let end = end.unwrap_or(u32::MAX);
    reply
        .trim()
        .split(',')
        .filter_map(|n| n.trim().parse::<u32>().ok())
        .filter(|line| (start..=end).contains(line))
        .sorted()
        .dedup()
        .collect()
}

fn with_condition(mut command: String, condition: Option<&str>) -> String {
    if let Some(condition) = condition.map(str::trim).filter(|c| !c.is_empty()) {
        command.push(' ');
        command.push_str(condition);
    }
    command
}

impl RuntimeConnection {
    /// Set a line breakpoint, return false if the debugger rejects the line.
    pub fn set_breakpoint(
        &self,
        path: &str,
        line: u32,
        condition: Option<&str>,
    ) -> Result<bool, Error> {
        let path = self.translate_to_debuggee(path);

        if path.ends_with(".pm") {
            let reply = self.run_command(&format!("require {}", perl_quote(&path)))?;
            if reply.contains("Can't locate") {
                debug!(target: "runtime", "module {path} not loadable: {reply}");
                return Ok(false);
            }
        }

        let reply = self.run_command(&with_condition(format!("b {path}:{line}"), condition))?;
        if reply.contains("not breakable") || reply.contains("No file matching") {
            return Ok(false);
        }

        lock(&self.breakpoints).add_line(LineBreakpoint {
            location: Location { path, line },
            condition: condition.map(ToString::to_string),
        });
        Ok(true)
    }

    /// Set a breakpoint on a subroutine entry, return resolved location or [`None`]
    /// if subroutine is unknown.
    ///
    /// The location is resolved first, nothing is set in the debuggee if it is unknown.
    pub fn set_function_breakpoint(
        &self,
        name: &str,
        condition: Option<&str>,
    ) -> Result<Option<FunctionLocation>, Error> {
        if let Some((package, _)) = name.rsplit_once("::") {
            if !package.is_empty() && package != "main" {
                let reply = self.run_command(&format!("require {package}"))?;
                if reply.contains("Can't locate") {
                    debug!(target: "runtime", "package {package} not loadable: {reply}");
                    return Ok(None);
                }
            }
        }

        let Some(location) = self.locate_sub(name)? else {
            debug!(target: "runtime", "subroutine {name} not found");
            return Ok(None);
        };

        let reply = self.run_command(&with_condition(format!("b {name}"), condition))?;
        if reply.contains("not found") {
            return Ok(None);
        }

        let path = self.translate_to_client(&location.path);
        let line = location.line;
        lock(&self.breakpoints).add_function(FunctionBreakpoint {
            name: name.to_string(),
            location,
            condition: condition.map(ToString::to_string),
        });

        Ok(Some(FunctionLocation {
            name: name.to_string(),
            path,
            line,
        }))
    }

    /// Location of the breakpoint `b <name>` sets, [`None`] if the subroutine is not
    /// registered in `%DB::sub`.
    ///
    /// A lookup reply that is neither empty nor a location, with no listing to fall back
    /// to, fails with [`Error::UnexpectedReply`].
    fn locate_sub(&self, name: &str) -> Result<Option<Location>, Error> {
        if self.reflection_available()? {
            let reply = self.run_command(&locate_sub_command(name))?;
            if let Some(sub) = muted_error!(
                serde_json::from_str::<SubLocation>(reply.trim()),
                "subroutine reflection:"
            ) {
                return Ok(Some(Location {
                    path: sub.file,
                    line: sub.line,
                }));
            }
        }

        let command = sub_entry_command(name);
        let reply = self.run_command(&command)?;
        if reply.trim().is_empty() {
            return Ok(None);
        }
        if let Some(location) = parse_sub_entry(&reply) {
            return Ok(Some(location));
        }

        let listing = self.run_command(&format!("l {name}"))?;
        let file = self.run_command("p $DB::filename")?;
        // return the listing window to the current position
        self.run_command(".")?;

        let file = file.trim();
        match parse_listing_line(&listing).filter(|_| !file.is_empty()) {
            Some(line) => Ok(Some(Location {
                path: file.to_string(),
                line,
            })),
            None => Err(Error::UnexpectedReply { command, reply }),
        }
    }

    fn clear_location(&self, location: &Location) -> Result<(), Error> {
        self.run_command(&format!("f {}", location.path))?;
        self.run_command(&format!("B {}", location.line))?;
        self.run_command(".")?;
        Ok(())
    }

    fn clear_locations(&self, locations: Vec<Location>) -> Result<(), Error> {
        for location in locations {
            self.clear_location(&location)?;
        }
        Ok(())
    }

    /// Remove all line breakpoints.
    pub fn clear_all_breakpoints(&self) -> Result<(), Error> {
        let locations = lock(&self.breakpoints).take_lines(|_| true);
        self.clear_locations(locations)
    }

    /// Remove line breakpoints of a single source file.
    pub fn clear_source_breakpoints(&self, path: &str) -> Result<(), Error> {
        let path = self.translate_to_debuggee(path);
        let locations = lock(&self.breakpoints).take_lines(|location| location.path == path);
        self.clear_locations(locations)
    }

    /// Remove all function breakpoints.
    pub fn clear_all_function_breakpoints(&self) -> Result<(), Error> {
        let locations = lock(&self.breakpoints).take_functions();
        self.clear_locations(locations)
    }

    /// Breakable lines of a source file in `[start, end]` range.
    pub fn get_breakpoint_locations(
        &self,
        path: &str,
        start: u32,
        end: Option<u32>,
    ) -> Result<Vec<u32>, Error> {
        let path = self.translate_to_debuggee(path);
        let last = end.map_or_else(|| "$#{$f}".to_string(), |end| end.to_string());
        let command = format!(
            "p do {{ no strict 'refs'; no warnings; my $f = 'main::_<' . {path}; \
             join ',', grep {{ ($$f[$_] // 0) != 0 }} {start} .. {last} }}",
            path = perl_quote(&path),
        );
        let reply = self.run_command(&command)?;
        Ok(parse_breakable_lines(&reply, start, end))
    }
}
