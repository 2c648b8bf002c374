//! quiz_sim — training and evaluation harness for the inferq engine.
//!
//! Runs a stream of training quizzes against a synthetic oracle: each quiz
//! hides a secret target and answers every question through a fixed banded
//! policy around it. Per quiz, stdout gets a result token
//! `[G=<target>,A=<asked>,P=<certainty%>]` on convergence or `-` otherwise;
//! every 256 quizzes a tab-separated progress line goes to the progress
//! file:
//!
//! ```text
//! quizIndex  totQuestionsAsked  precision  avgQuizLen  avgCertainty  questionsPerSecond
//! ```
//!
//! Exit code 0 on success, nonzero on any engine failure.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;

use inferq_core::SplitMix64;
use inferq_rs::{create_engine, Backend, EngineDefinition, EngineDimensions, EngineMode};

#[derive(Parser, Debug)]
#[command(name = "quiz_sim", about = "Train an inferq engine against a banded oracle")]
struct Args {
    /// Number of questions in the KB.
    #[arg(long, default_value_t = 1000)]
    questions: usize,

    /// Number of targets in the KB.
    #[arg(long, default_value_t = 1000)]
    targets: usize,

    /// Size of the answer alphabet (the banded policy needs 5).
    #[arg(long, default_value_t = 5)]
    answers: usize,

    /// Initial amount α₀ seeded into every KB cell.
    #[arg(long, default_value_t = 0.1)]
    init_amount: f64,

    /// Number of training quizzes to run.
    #[arg(long, default_value_t = 1_000_000)]
    quizzes: u64,

    /// Give up on a quiz after this many questions.
    #[arg(long, default_value_t = 100)]
    max_quiz_len: u64,

    /// Half-width of the oracle's answer bands.
    #[arg(long, default_value_t = 32)]
    band: i64,

    /// Seed for the secret-target stream.
    #[arg(long, default_value_t = 0x5EED)]
    seed: u64,

    /// Worker threads (defaults to hardware parallelism).
    #[arg(long)]
    workers: Option<usize>,

    /// Progress file, appended every 256 quizzes.
    #[arg(long, default_value = "progress.txt")]
    progress_file: PathBuf,

    /// Load the KB from this file before training.
    #[arg(long)]
    load_kb: Option<PathBuf>,

    /// Save the KB to this file after training.
    #[arg(long)]
    save_kb: Option<PathBuf>,
}

/// The banded oracle: the answer a user holding secret `g` gives to `q`.
fn banded_answer(g: i64, q: i64, band: i64) -> usize {
    if g < q - band {
        0
    } else if g < q {
        1
    } else if g == q {
        2
    } else if g <= q + band {
        3
    } else {
        4
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    if args.answers != 5 {
        bail!("the banded oracle produces exactly 5 answers, got --answers {}", args.answers);
    }

    let mut def = EngineDefinition::new(EngineDimensions {
        n_answers: args.answers,
        n_questions: args.questions,
        n_targets: args.targets,
    });
    def.init_amount = args.init_amount;
    def.n_workers = args.workers;
    let engine = create_engine(Backend::Cpu, &def).context("failed to instantiate the engine")?;

    if let Some(path) = &args.load_kb {
        engine.switch_mode(EngineMode::Maintenance)?;
        engine
            .load_kb(path)
            .with_context(|| format!("failed to load KB from {}", path.display()))?;
        engine.switch_mode(EngineMode::Regular)?;
    }

    let mut progress = BufWriter::new(
        File::create(&args.progress_file)
            .with_context(|| format!("failed to create {}", args.progress_file.display()))?,
    );

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut rng = SplitMix64::new(args.seed);

    let mut n_correct: u64 = 0;
    let mut sum_quiz_lens: u64 = 0;
    let mut tot_certainty: f64 = 0.0;
    let mut block_start = Instant::now();
    let mut prev_asked = engine.total_questions_asked();

    for i in 0..args.quizzes {
        if i % 256 == 0 && i != 0 {
            let tot_asked = engine.total_questions_asked();
            let precision = n_correct as f64 * 100.0 / 256.0;
            let elapsed = block_start.elapsed().as_secs_f64();
            let denom = n_correct.max(1) as f64;
            write!(out, "\n*{tot_asked};{precision:.2}%*")?;
            out.flush()?;
            writeln!(
                progress,
                "{i}\t{tot_asked}\t{precision:.6}\t{:.6}\t{:.6}\t{:.6}",
                sum_quiz_lens as f64 / denom,
                tot_certainty / denom,
                (tot_asked - prev_asked) as f64 / elapsed
            )?;
            progress.flush()?;
            n_correct = 0;
            sum_quiz_lens = 0;
            tot_certainty = 0.0;
            block_start = Instant::now();
            prev_asked = tot_asked;
        }

        let guess = rng.below(args.targets as u64) as usize;
        let quiz = engine.start_quiz().context("failed to create a quiz")?;
        let mut converged = false;
        for j in 0..args.max_quiz_len {
            let question = engine
                .next_question(quiz)
                .context("failed to query the next question")?;
            let answer = banded_answer(guess as i64, question as i64, args.band);
            engine
                .record_answer(quiz, answer)
                .context("failed to record the answer")?;

            let top = engine
                .list_top_targets(quiz, 1)
                .context("failed to list top targets")?;
            if top.first().is_some_and(|r| r.target == guess) {
                let certainty = top[0].probability * 100.0;
                n_correct += 1;
                sum_quiz_lens += j + 1;
                tot_certainty += certainty;
                write!(out, "[G={guess},A={},P={certainty:.2}%]", j + 1)?;
                converged = true;
                break;
            }
        }
        if !converged {
            write!(out, "-")?;
        }
        engine
            .record_quiz_target(quiz, guess)
            .context("failed to record the quiz target")?;
        engine.release_quiz(quiz).context("failed to release the quiz")?;
    }
    writeln!(out)?;
    out.flush()?;

    if let Some(path) = &args.save_kb {
        engine.switch_mode(EngineMode::Maintenance)?;
        engine
            .save_kb(path)
            .with_context(|| format!("failed to save KB to {}", path.display()))?;
        log::info!("KB saved to {}", path.display());
    }
    Ok(())
}
