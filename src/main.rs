extern crate log;
extern crate pretty_env_logger;

use std::path::Path;
use std::process::exit;

use clap::{arg, command, value_parser, ArgAction, Command};
use log::info;
use rayon::prelude::*;

use hmpb_interpreter::election::Election;
use hmpb_interpreter::interpret::{
    load_page_image, InterpretError, InterpretOptions, InterpretedBallot, Interpreter,
    InterpreterOptions,
};
use hmpb_interpreter::segments::EdgeRunDetector;

fn main() {
    pretty_env_logger::init_custom_env("LOG");

    let matches = cli().get_matches();
    let election_definition_path = matches
        .get_one::<String>("election")
        .expect("election path is required");
    let template_paths = matches
        .get_many::<String>("template")
        .expect("template paths are required")
        .collect::<Vec<_>>();
    let ballot_paths = matches
        .get_many::<String>("ballots")
        .expect("ballot paths are required")
        .collect::<Vec<_>>();

    let election_definition_json = match std::fs::read_to_string(election_definition_path) {
        Ok(json) => json,
        Err(e) => {
            eprintln!("Error reading election definition: {}", e);
            exit(1);
        }
    };

    let election: Election = match serde_json::from_str(&election_definition_json) {
        Ok(election_definition) => election_definition,
        Err(e) => {
            eprintln!("Error parsing election definition: {}", e);
            exit(1);
        }
    };

    let options = InterpreterOptions {
        test_mode: matches.get_flag("test-mode"),
        mark_score_vote_threshold: matches.get_one::<f32>("threshold").copied(),
        ..InterpreterOptions::default()
    };
    let mut interpreter = Interpreter::new(election, options);
    if matches.get_flag("lines") {
        interpreter = interpreter.with_line_detector(Box::new(EdgeRunDetector::default()));
    }

    for template_path in template_paths {
        let result = load_page_image(Path::new(template_path))
            .and_then(|image| interpreter.add_template(image, None).map(|_| ()));
        if let Err(e) = result {
            eprintln!("Error adding template {}: {}", template_path, e);
            exit(1);
        }
    }
    interpreter.finalize();

    if interpreter.has_missing_templates() {
        for missing in interpreter.missing_templates() {
            eprintln!("Missing template: {}", missing);
        }
        exit(1);
    }

    let interpret_options = InterpretOptions::default();
    let results = ballot_paths
        .par_iter()
        .map(|path| {
            let result: Result<InterpretedBallot, InterpretError> = load_page_image(Path::new(path))
                .and_then(|image| interpreter.interpret_ballot(image, None, &interpret_options));
            (path, result)
        })
        .collect::<Vec<_>>();

    let mut failures = 0;
    for (path, result) in results {
        match result {
            Ok(ballot) => {
                let output = serde_json::json!({ "path": path, "ballot": ballot });
                println!("{}", output);
            }
            Err(e) => {
                eprintln!("Error interpreting {}: {}", path, e);
                failures += 1;
            }
        }
    }

    info!(
        "interpreted {} of {} ballot(s)",
        ballot_paths.len() - failures,
        ballot_paths.len()
    );
    if failures > 0 {
        exit(1);
    }
}

fn cli() -> Command {
    command!()
        .arg(arg!(-e --election <PATH> "Path to election.json file").required(true))
        .arg(
            arg!(-t --template <PATH> "Path to a blank ballot page image; repeat for every page")
                .required(true)
                .action(ArgAction::Append),
        )
        .arg(arg!(--"test-mode" "Interpret test ballots instead of live ones"))
        .arg(
            arg!(--threshold <SCORE> "Mark score at or above which a target counts as a vote")
                .value_parser(value_parser!(f32)),
        )
        .arg(arg!(--lines "Register ballots using ruled lines when possible"))
        .arg(
            arg!(ballots: <BALLOT_IMAGE> "Paths to ballot page images")
                .required(true)
                .num_args(1..),
        )
}
