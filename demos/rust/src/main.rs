use std::{fs, thread::sleep, time::Duration};

use bucketing::{
    Engine, EngineHandle, ForceGroupsOptions, Identifiers, RuleContext, TestMatrix, TestType,
    validation::ProvidedContext,
};

const MATRIX_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/matrix.json");

fn load_engine() -> anyhow::Result<Engine> {
    let matrix: TestMatrix = serde_json::from_str(&fs::read_to_string(MATRIX_PATH)?)?;
    Ok(Engine::from_matrix(&matrix, &ProvidedContext::unavailable())?)
}

/// An example usage of the Rust bucketing library
/// Every 3 seconds, reloads `matrix.json` and prints the buckets of a few users
///
/// Editing the matrix is reflected in stdout
/// ^C to exit
fn main() -> anyhow::Result<()> {
    let handle = EngineHandle::new(load_engine()?);
    let context = RuleContext::new().with("country", "US").with("lang", "en");
    let force = ForceGroupsOptions::new();

    loop {
        sleep(Duration::from_secs(3));
        match load_engine() {
            Ok(engine) => {
                handle.replace(engine);
            }
            Err(e) => eprintln!("keeping previous matrix: {e}"),
        }

        let engine = handle.load();
        for user in ["user-1", "user-2", "user-3"] {
            let ids = Identifiers::single(TestType::User, user);
            let result = engine.determine_assignments(&ids, &context, &force, &[]);
            let buckets: Vec<String> = result
                .buckets()
                .iter()
                .map(|(test, bucket)| format!("{test}={}", bucket.name))
                .collect();
            println!("{user} (v{}): {}", result.matrix_version(), buckets.join(" | "));
        }
    }
}
