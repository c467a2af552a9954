use anyhow::{Context, Result};
use clap::Parser;
use dilemma_core::{ActivationOrder, Model, ModelConfig, Stage};
use tracing::info;

#[derive(Debug, Parser)]
#[command(
    name = "dilemma",
    about = "Iterated prisoner's dilemma population simulation"
)]
struct Cli {
    /// Number of ticks to simulate.
    #[arg(long, default_value_t = 20)]
    steps: usize,

    /// Initial population size.
    #[arg(long, default_value_t = 50)]
    population: usize,

    /// Activation order: sequential, random, or simultaneous.
    #[arg(long, default_value = "random")]
    activation: String,

    /// Strategy stage: fixed-action, green-beard-one-allele,
    /// green-beard-two-allele, or reputation.
    #[arg(long, default_value = "fixed-action")]
    stage: String,

    /// Fraction of the cohort seeded cooperative, in [0, 1].
    #[arg(long, default_value_t = 0.5)]
    distribution: f64,

    /// Divisor applied to payoffs, the resource cost of raising offspring.
    #[arg(long, default_value_t = 1.0)]
    child_cost: f64,

    /// RNG seed for reproducible runs.
    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let activation: ActivationOrder = cli.activation.parse()?;
    let stage: Stage = cli.stage.parse()?;
    let config = ModelConfig {
        initial_population: cli.population,
        activation,
        stage,
        cooperation_distribution: cli.distribution,
        child_cost: cli.child_cost,
        rng_seed: cli.seed,
        ..ModelConfig::default()
    };

    let mut model = Model::new(config).context("failed to construct model")?;
    info!(
        population = cli.population,
        %activation,
        %stage,
        steps = cli.steps,
        "starting simulation"
    );

    for _ in 0..cli.steps {
        let summary = model.step().context("simulation step failed")?;
        info!(
            tick = summary.tick.0,
            agents = summary.agent_count,
            cooperating = summary.cooperating,
            births = summary.births,
            deaths = summary.deaths,
            "tick complete"
        );
    }

    let last = model.metrics();
    match stage {
        Stage::GreenBeardOneAllele | Stage::GreenBeardTwoAllele => info!(
            agents = last.agent_count,
            bearded = last.bearded,
            true_beards = last.true_beards,
            impostors = last.impostors,
            suckers = last.suckers,
            cowards = last.cowards,
            "final population"
        ),
        Stage::Reputation => info!(
            agents = last.agent_count,
            cooperating = last.cooperating,
            average_trust = last.average_trust,
            average_reputation = last.average_reputation,
            "final population"
        ),
        Stage::FixedAction => info!(
            agents = last.agent_count,
            cooperating = last.cooperating,
            "final population"
        ),
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
