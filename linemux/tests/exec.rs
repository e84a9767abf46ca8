#![cfg(unix)]

use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use anyhow::{Context, Result};
use linemux::{
    exec::{ChildCommand, ChildOutput, ExecError, Supervisor},
    line::ReaderOptions,
};
use tokio::{
    io::{AsyncWriteExt, duplex},
    time::{Instant, sleep, timeout},
};

const RUN_TIMEOUT: Duration = Duration::from_secs(10);

fn scratch_dir(name: &str) -> Result<PathBuf> {
    static NEXT: AtomicU32 = AtomicU32::new(0);
    let dir = std::env::temp_dir().join(format!(
        "linemux-{name}-{}-{}",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    Ok(dir)
}

/// Every generation copies its stdin into `<dir>/<pid>.out`.
fn recording_command(dir: &Path) -> ChildCommand {
    ChildCommand::new("sh")
        .args(["-c", "cat > \"$0/$$.out\""])
        .args([dir.as_os_str()])
        .stdout(ChildOutput::Null)
}

/// Like [`recording_command`], but each generation lingers after its input
/// closes, taking longer to exit than a rotation period.
fn slow_exiting_recording_command(dir: &Path) -> ChildCommand {
    ChildCommand::new("sh")
        .args(["-c", "cat > \"$0/$$.out\"; sleep 0.15"])
        .args([dir.as_os_str()])
        .stdout(ChildOutput::Null)
}

fn shell(script: &str) -> ChildCommand {
    ChildCommand::new("sh")
        .args(["-c", script])
        .stdout(ChildOutput::Null)
        .stderr(ChildOutput::Null)
}

fn recorded_generations(dir: &Path) -> Result<Vec<Vec<u64>>> {
    let mut generations = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let contents = std::fs::read_to_string(entry?.path())?;
        let lines = contents
            .lines()
            .map(|line| line.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()?;
        generations.push(lines);
    }
    generations.sort_by_key(|lines| lines.first().copied().unwrap_or(u64::MAX));
    Ok(generations)
}

#[tokio::test]
async fn rotates_while_input_flows_without_losing_lines() -> Result<()> {
    let dir = scratch_dir("rotate")?;
    let (mut input, source) = duplex(4096);
    let supervisor = Supervisor::new(recording_command(&dir))
        .rotate_every(Some(Duration::from_millis(100)));
    let run = tokio::spawn(supervisor.run(source));

    let started = Instant::now();
    let mut sent = 0u64;
    while started.elapsed() < Duration::from_millis(350) {
        input.write_all(format!("{sent}\n").as_bytes()).await?;
        sent += 1;
        sleep(Duration::from_millis(2)).await;
    }
    drop(input);

    let summary = timeout(RUN_TIMEOUT, run).await???;
    assert!(
        summary.generations >= 3,
        "expected at least 3 generations, got {}",
        summary.generations
    );
    assert_eq!(summary.lines, sent);

    let generations = recorded_generations(&dir)?;
    assert_eq!(generations.len() as u64, summary.generations);

    let mut all: Vec<u64> = Vec::new();
    for lines in &generations {
        assert!(
            lines.windows(2).all(|pair| pair[1] == pair[0] + 1),
            "each generation sees a contiguous run: {lines:?}"
        );
        all.extend(lines);
    }
    let expected: Vec<u64> = (0..sent).collect();
    assert_eq!(all, expected, "no line dropped or duplicated across generations");

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

#[tokio::test]
async fn slow_exiting_child_still_gets_a_full_period() -> Result<()> {
    const LINES: u64 = 10;

    let dir = scratch_dir("slow-exit")?;
    let (mut input, source) = duplex(1024);
    let supervisor = Supervisor::new(slow_exiting_recording_command(&dir))
        .rotate_every(Some(Duration::from_millis(100)));
    let run = tokio::spawn(supervisor.run(source));

    for value in 0..LINES {
        input.write_all(format!("{value}\n").as_bytes()).await?;
        sleep(Duration::from_millis(30)).await;
    }
    drop(input);

    let summary = timeout(RUN_TIMEOUT, run)
        .await
        .context("supervisor kept rotating without forwarding input")???;
    assert_eq!(summary.lines, LINES);
    assert!(
        summary.generations >= 2,
        "expected a rotation, got {} generation(s)",
        summary.generations
    );

    let generations = recorded_generations(&dir)?;
    assert_eq!(generations.len() as u64, summary.generations);
    let all: Vec<u64> = generations.into_iter().flatten().collect();
    let expected: Vec<u64> = (0..LINES).collect();
    assert_eq!(all, expected);

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

#[tokio::test]
async fn single_generation_without_rotation() -> Result<()> {
    let dir = scratch_dir("single")?;
    let summary = Supervisor::new(recording_command(&dir))
        .run(&b"one\r\ntwo\nthree"[..])
        .await?;
    assert_eq!(summary.generations, 1);
    assert_eq!(summary.lines, 3);

    let mut outputs = std::fs::read_dir(&dir)?;
    let path = outputs.next().context("one output file")??.path();
    assert_eq!(std::fs::read_to_string(path)?, "one\ntwo\nthree\n");

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

#[tokio::test]
async fn failing_child_at_end_of_input_reports_its_code() {
    let result = Supervisor::new(shell("cat >/dev/null; exit 7"))
        .run(&b"a\nb\n"[..])
        .await;
    match result {
        Err(err @ ExecError::ChildExited { generation: 0, code: 7 }) => {
            assert_eq!(err.exit_code(), 7);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn failing_child_during_rotation_stops_the_run() -> Result<()> {
    let (mut input, source) = duplex(1024);
    let run = tokio::spawn(
        Supervisor::new(shell("cat >/dev/null; exit 3"))
            .rotate_every(Some(Duration::from_millis(50)))
            .run(source),
    );
    input.write_all(b"kept open\n").await?;

    let result = timeout(RUN_TIMEOUT, run).await??;
    assert!(matches!(
        result,
        Err(ExecError::ChildExited {
            generation: 0,
            code: 3
        })
    ));
    Ok(())
}

#[tokio::test]
async fn child_closing_its_input_ends_the_run() -> Result<()> {
    let (mut input, source) = duplex(1024);
    let run = tokio::spawn(Supervisor::new(shell("head -n 1 >/dev/null")).run(source));

    // Never end the input; the child hanging up is what stops the supervisor.
    let feeder = tokio::spawn(async move {
        let mut value = 0u64;
        while input.write_all(format!("{value}\n").as_bytes()).await.is_ok() {
            value += 1;
            sleep(Duration::from_millis(1)).await;
        }
    });

    let summary = timeout(RUN_TIMEOUT, run).await???;
    assert_eq!(summary.generations, 1);
    timeout(RUN_TIMEOUT, feeder).await??;
    Ok(())
}

#[tokio::test]
async fn input_error_is_reported_after_draining() -> Result<()> {
    let dir = scratch_dir("input-error")?;
    let result = Supervisor::new(recording_command(&dir))
        .reader_options(ReaderOptions {
            max_line_bytes: 4,
            ..ReaderOptions::default()
        })
        .run(&b"ok\noversized\nlost\n"[..])
        .await;
    assert!(matches!(result, Err(ExecError::Input(_))));

    let generations = recorded_generations_raw(&dir)?;
    assert_eq!(generations, vec!["ok\n".to_string()]);

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

fn recorded_generations_raw(dir: &Path) -> Result<Vec<String>> {
    std::fs::read_dir(dir)?
        .map(|entry| -> Result<String> { Ok(std::fs::read_to_string(entry?.path())?) })
        .collect()
}
