use std::{env, time::Duration};

use surge::{
    BasicScenario, BoxError, FileSchedule, Run, RunOptions, StdoutReporter, TriggerOptions,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    surge::logging::init("surge=info")?;
    // NEVER build heavy things like clients inside the iteration
    // unless you want to kill performance
    let client = reqwest::Client::new();
    let target = env::var("TARGET_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());

    // pass a schedule file to drive the run from it, otherwise ramp up and hold
    let (name, trigger, options) = match env::args().nth(1) {
        Some(path) => {
            let schedule = FileSchedule::load(path)?;
            let options = RunOptions::from_limits(schedule.limits());
            (schedule.scenario().to_string(), schedule.trigger()?, options)
        }
        None => {
            let trigger = TriggerOptions::staged("0s:0, 10s:50, 30s:50, 10s:0", "1s")?.build()?;
            let options = RunOptions::builder()
                .max_duration(Duration::from_secs(60))
                .max_failures_rate(1.0)
                .build();
            ("http".to_string(), trigger, options)
        }
    };

    let result = Run::builder()
        .scenario(
            BasicScenario::builder()
                .name(name)
                .iteration(move || {
                    let client = client.clone();
                    let target = target.clone();
                    async move {
                        client.get(target).send().await?.error_for_status()?;
                        Ok::<(), BoxError>(())
                    }
                })
                .build(),
        )
        .trigger(trigger)
        .options(options)
        .reporter(StdoutReporter)
        .build()
        .execute()
        .await;

    if !result.passed() {
        std::process::exit(1);
    }
    Ok(())
}
