use std::{env, fs, process::ExitCode, time::Instant};

use wyrm::{Engine, StdPrint};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let mut script_path: Option<&str> = None;
    let mut profile_path: Option<&str> = None;

    let mut index = 1;
    while index < args.len() {
        match args[index].as_str() {
            "--profile" => {
                index += 1;
                match args.get(index) {
                    Some(path) => profile_path = Some(path),
                    None => {
                        eprintln!("error: --profile needs an output path");
                        return ExitCode::FAILURE;
                    }
                }
            }
            path if script_path.is_none() => script_path = Some(path),
            extra => {
                eprintln!("error: unexpected argument '{extra}'");
                return ExitCode::FAILURE;
            }
        }
        index += 1;
    }

    let Some(script_path) = script_path else {
        eprintln!("usage: wyrm <script> [--profile <out.html>]");
        return ExitCode::FAILURE;
    };

    let source = match fs::read_to_string(script_path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("error: cannot read '{script_path}': {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut engine = Engine::new();
    if profile_path.is_some() {
        engine.enable_profiling();
    }

    let (source_id, module) = match engine.parse(script_path, &source) {
        Ok(parsed) => parsed,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let start = Instant::now();
    let mut print = StdPrint::new();
    if let Err(err) = engine.run_module(&module, &mut print) {
        let elapsed = start.elapsed();
        eprintln!("{err}");
        eprintln!("failed after {elapsed:?}");
        return ExitCode::FAILURE;
    }
    drop(print);
    let elapsed = start.elapsed();
    eprintln!("finished in {elapsed:?}");

    if let Some(profile_path) = profile_path {
        let mut out = match fs::File::create(profile_path) {
            Ok(file) => file,
            Err(err) => {
                eprintln!("error: cannot create '{profile_path}': {err}");
                return ExitCode::FAILURE;
            }
        };
        if let Err(err) = engine.dump_profile(source_id, &mut out) {
            eprintln!("error: cannot write profile: {err}");
            return ExitCode::FAILURE;
        }
        eprintln!("profile written to {profile_path}");
    }

    ExitCode::SUCCESS
}
