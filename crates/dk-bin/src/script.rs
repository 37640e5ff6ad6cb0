//! Edit-script parsing for the headless driver.
//!
//! One command per line, `#` comments, blank lines ignored:
//!
//! ```text
//! exposure 1.0 0.005
//! temperature 1.2 0.9
//! sharpen 0.75
//! flip xy
//! undo
//! redo
//! render
//! ```

use anyhow::{Context, Result, bail};

use core_module::builtin::{
    ExposureParams, FlipParams, SharpenParams, TemperatureParams, orientation,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Commit parameters to an operation instance.
    Edit { op: &'static str, params: Vec<u8> },
    Undo,
    Redo,
    /// Render all three pipelines now.
    Render,
}

pub fn parse_script(text: &str) -> Result<Vec<Command>> {
    let mut out = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        out.push(parse_line(line).with_context(|| format!("script line {}", lineno + 1))?);
    }
    Ok(out)
}

fn parse_line(line: &str) -> Result<Command> {
    let mut parts = line.split_whitespace();
    let cmd = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();
    let f = |i: usize| -> Result<f32> {
        args.get(i)
            .with_context(|| format!("`{cmd}` needs argument {}", i + 1))?
            .parse::<f32>()
            .with_context(|| format!("`{cmd}` argument {} is not a number", i + 1))
    };
    match cmd {
        "exposure" => {
            let ev = f(0)?;
            let black = if args.len() > 1 { f(1)? } else { 0.0 };
            Ok(Command::Edit {
                op: "exposure",
                params: ExposureParams { ev, black }.to_bytes(),
            })
        }
        "temperature" => Ok(Command::Edit {
            op: "temperature",
            params: TemperatureParams {
                red_gain: f(0)?,
                blue_gain: f(1)?,
            }
            .to_bytes(),
        }),
        "sharpen" => Ok(Command::Edit {
            op: "sharpen",
            params: SharpenParams { amount: f(0)? }.to_bytes(),
        }),
        "flip" => {
            let o = match args.first().copied().unwrap_or("none") {
                "none" => orientation::NONE,
                "x" => orientation::FLIP_X,
                "y" => orientation::FLIP_Y,
                "xy" => orientation::FLIP_X | orientation::FLIP_Y,
                other => bail!("unknown flip orientation `{other}`"),
            };
            Ok(Command::Edit {
                op: "flip",
                params: FlipParams { orientation: o }.to_bytes(),
            })
        }
        "undo" => Ok(Command::Undo),
        "redo" => Ok(Command::Redo),
        "render" => Ok(Command::Render),
        other => bail!("unknown command `{other}`"),
    }
}
