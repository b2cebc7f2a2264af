use std::{
    io::{self, BufRead, Write},
    path::Path,
    sync::Arc,
};

use color_eyre::Result;
use shex::{
    config::{Config, MonitorConfig},
    console::{Console, NoConsole, Terminal},
    env::NoSystemAliases,
    shell::SUBSHELL_ENV,
    Shell,
};
use tracing_subscriber::prelude::*;

#[macro_use]
extern crate tracing;

/// What the command line asked for.
enum Mode {
    Interactive,
    Expression(String),
    Script(String),
}

fn mode(config: &Config) -> Mode {
    let mut args = std::env::args().skip(1);

    match args.next() {
        None => Mode::Interactive,
        Some(flag) if flag == "-c" || flag == config.subshell.switch => {
            Mode::Expression(args.collect::<Vec<_>>().join(" "))
        }
        // arguments after the script name are not expanded by scripts
        Some(script) => Mode::Script(script),
    }
}

fn console(config: &MonitorConfig) -> Arc<dyn Console> {
    if !termion::is_tty(&io::stdin()) {
        return Arc::new(NoConsole);
    }

    match Terminal::new(config) {
        Ok(terminal) => Arc::new(terminal),
        Err(err) => {
            warn!(%err, "console input unavailable");
            Arc::new(NoConsole)
        }
    }
}

fn prompt() -> io::Result<()> {
    let cwd = std::env::current_dir()
        .map(|dir| dir.display().to_string())
        .unwrap_or_default();

    let mut stdout = io::stdout().lock();
    write!(stdout, "{cwd} $ ")?;
    stdout.flush()
}

async fn read_line() -> Result<Option<String>> {
    let line = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line).map(|read| (read > 0).then_some(line))
    })
    .await??;

    Ok(line)
}

fn report_jobs(shell: &Shell) {
    for job in shell.jobs().reap() {
        eprintln!(
            "[{}] done ({}) {}",
            job.id,
            job.exit.unwrap_or_default(),
            job.text
        );
    }
}

async fn interactive(shell: &Shell) -> Result<i32> {
    loop {
        report_jobs(shell);
        prompt()?;

        let Some(line) = read_line().await? else {
            break;
        };

        shell.cancel().reset();

        // empty unless the config keeps keys typed while the last line ran
        let typeahead = String::from_utf8_lossy(&shell.console().take_typeahead()).into_owned();
        let line = format!("{typeahead}{}", line.trim_end_matches(['\r', '\n']));

        if line.trim().is_empty() {
            continue;
        }

        shell.execute_expression(&line).await;

        if let Some(code) = shell.exit_requested() {
            return Ok(code);
        }
    }

    Ok(shell.exit_requested().unwrap_or_else(|| shell.error_level()))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::load()?;

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(
        &config.log.directory,
        &config.log.file_name,
    ));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(writer))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_error::ErrorLayer::default())
        .init();

    color_eyre::install()?;

    if let Ok(exe) = std::env::current_exe() {
        std::env::set_var(SUBSHELL_ENV, exe);
    }

    let mode = mode(&config);
    let console = console(&config.monitor);
    let shell = Shell::with_parts(config, console, Arc::new(NoSystemAliases));
    shell.cancel().listen_for_interrupts()?;

    let code = match mode {
        Mode::Interactive => {
            trace!("starting interactive loop");
            interactive(&shell).await?
        }
        Mode::Expression(expr) => {
            debug!(%expr, "running expression");
            shell.mark_as_subshell();
            let code = shell.execute_expression(&expr).await;
            shell.exit_requested().unwrap_or(code)
        }
        Mode::Script(path) => {
            debug!(%path, "running script");
            shell.run_script(Path::new(&path)).await?
        }
    };

    drop(guard);
    std::process::exit(code);
}
