//! Golden-file tests driven by `tests/fixtures/*.wisp-asm`.
//!
//! Each fixture is a textual assembly program (see [`wisp::asm`]) ending in
//! one or more `# directive: value` comment lines that steer how it's run
//! and checked. `# expect: <value>` compares the program's result against
//! `Value::to_display_string`; `# error: <substring>` instead requires the
//! run to fail with an error whose `Display` contains the substring.
//! `# max_steps:`, `# disable_recursion:`, and `# max_call_stack_depth:`
//! configure the `ThreadOptions` the fixture runs under.

use std::{path::Path, rc::Rc};

use pretty_assertions::assert_eq;
use wisp::{NoopTracer, RunError, Thread, ThreadOptions, asm, run_program};

#[derive(Debug, Default)]
struct Directives {
    expect: Option<String>,
    error: Option<String>,
    max_steps: Option<u64>,
    disable_recursion: bool,
    max_call_stack_depth: Option<u32>,
}

fn parse_directives(text: &str) -> Directives {
    let mut d = Directives::default();
    for line in text.lines() {
        let Some(rest) = line.trim_start().strip_prefix('#') else { continue };
        let Some((key, value)) = rest.split_once(':') else { continue };
        let value = value.trim();
        match key.trim() {
            "expect" => d.expect = Some(value.to_owned()),
            "error" => d.error = Some(value.to_owned()),
            "max_steps" => d.max_steps = value.parse().ok(),
            "disable_recursion" => d.disable_recursion = value == "true",
            "max_call_stack_depth" => d.max_call_stack_depth = value.parse().ok(),
            _ => {}
        }
    }
    d
}

fn run_fixture(path: &Path) -> datatest_stable::Result<()> {
    let text = std::fs::read_to_string(path)?;
    let directives = parse_directives(&text);

    let program = asm::assemble(&text).map_err(|e| format!("{}: assembly failed at line {}: {}", path.display(), e.line, e.message))?;

    let name = path.file_stem().and_then(|s| s.to_str()).unwrap_or("fixture").to_owned();
    let options = ThreadOptions {
        name,
        max_steps: directives.max_steps,
        disable_recursion: directives.disable_recursion,
        max_call_stack_depth: directives.max_call_stack_depth,
        ..ThreadOptions::default()
    };

    let mut thread = Thread::<NoopTracer>::new(options);
    let result: Result<_, RunError> = run_program(&mut thread, Rc::new(program));

    match (&directives.expect, &directives.error) {
        (Some(expected), None) => {
            let value = result.map_err(|e| format!("{}: unexpected error: {e}", path.display()))?;
            assert_eq!(value.to_display_string(16), *expected, "{}", path.display());
        }
        (None, Some(expected_substr)) => {
            let err = result.err().ok_or_else(|| format!("{}: expected an error but the program returned a value", path.display()))?;
            let message = err.to_string();
            assert!(
                message.contains(expected_substr.as_str()),
                "{}: error {message:?} does not contain {expected_substr:?}",
                path.display()
            );
        }
        (Some(_), Some(_)) => panic!("{}: fixture sets both `expect` and `error`", path.display()),
        (None, None) => panic!("{}: fixture needs an `# expect:` or `# error:` directive", path.display()),
    }
    Ok(())
}

datatest_stable::harness!(run_fixture, "tests/fixtures", r"^.*\.wisp-asm$");
