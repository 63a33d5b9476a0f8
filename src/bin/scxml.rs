//! Demonstration and manual-test CLI.
//! Usage:
//!    scxml <scxml-file> [<scxml-file>...] [-trace <mode>]

use std::io::{stdout, Write};
use std::sync::mpsc::Sender;
use std::{io, process, thread, time};

use log::error;

use statechart_rt::common::init_logging;
use statechart_rt::fsm::{Event, EventType};
use statechart_rt::fsm_executor::FsmExecutor;
#[cfg(feature = "Trace")]
use statechart_rt::common::handle_trace;
#[cfg(feature = "xml")]
use statechart_rt::scxml_reader::INCLUDE_PATH_ARGUMENT_OPTION;
#[cfg(feature = "Trace")]
use statechart_rt::tracer::{TraceMode, TRACE_ARGUMENT_OPTION};

#[allow(unused_mut)]
fn input_loop(mut sender: Sender<Box<Event>>) {
    let mut line = String::new();
    let stdin = io::stdin();
    loop {
        print!("\nEnter Event >>");
        let _ = stdout().flush();
        line.clear();
        match stdin.read_line(&mut line) {
            Ok(_s) => {
                if line.ends_with('\n') {
                    line.pop();
                    if line.ends_with('\r') {
                        line.pop();
                    }
                }
                let line_lc = line.to_lowercase();
                #[cfg(feature = "Trace")]
                if line_lc.starts_with("tron") && line.len() > 5 {
                    handle_trace(&mut sender, &line_lc[5..], true);
                    continue;
                } else if line_lc.starts_with("troff") && line_lc.len() > 6 {
                    handle_trace(&mut sender, &line_lc[6..], false);
                    continue;
                }
                if !line_lc.eq("help") && !line.is_empty() {
                    let event = Box::new(Event {
                        name: line.clone(),
                        etype: EventType::external,
                        sendid: None,
                        origin: None,
                        origin_type: None,
                        invoke_id: None,
                        param_values: None,
                        content: None,
                    });
                    if let Err(e) = sender.send(event) {
                        eprintln!("Error sending event: {}. aborting...", e);
                        process::exit(2);
                    }
                } else {
                    println!(
                        "Usage:\nUse 'tron <mode>' or 'troff <mode>' to control trace levels, \
                         e.g. 'tron all'.\nTo send an event, type its name and press enter.\n\
                         Event names are case sensitive.\n\
                         Enter 'help' or an empty line to print this again.\n"
                    );
                }
            }
            Err(e) => {
                eprintln!("Error: {}. aborting...", e);
                process::exit(1);
            }
        }
    }
}

/// Loads the specified chart(s) and prompts for events on stdin.
fn main() {
    init_logging();

    let (named_opt, final_args) = statechart_rt::common::get_arguments(&[
        #[cfg(feature = "Trace")]
        &TRACE_ARGUMENT_OPTION,
        #[cfg(feature = "xml")]
        &INCLUDE_PATH_ARGUMENT_OPTION,
    ]);

    #[cfg(feature = "Trace")]
    let trace = TraceMode::from_arguments(&named_opt);

    if final_args.is_empty() {
        println!("Missing argument. Please specify one or more scxml files");
        process::exit(1);
    }

    let mut executor = FsmExecutor::new_with_io_processor();
    #[cfg(feature = "xml")]
    executor.set_include_paths_from_arguments(&named_opt);

    let mut session = match executor.execute(
        final_args[0].as_str(),
        #[cfg(feature = "Trace")]
        trace,
    ) {
        Ok(s) => s,
        Err(err) => {
            error!("Failed to execute {}: {}", final_args[0], err);
            process::exit(1);
        }
    };

    let Some(session_thread) = session.thread.take() else {
        error!("Failed to spawn FSM");
        process::exit(1);
    };

    for fi in &final_args[1..] {
        let _ = executor.execute(
            fi.as_str(),
            #[cfg(feature = "Trace")]
            trace,
        );
    }

    let sender_clone = session.sender.clone();

    // Give the FSMs some time to process their initial transitions, so the prompt
    // below is printed after their startup output rather than interleaved with it.
    thread::sleep(time::Duration::from_millis(200));

    match thread::Builder::new()
        .name("input".to_string())
        .spawn(move || input_loop(sender_clone))
    {
        Ok(_) => {
            let _ = session_thread.join();
            println!("\nSM finished!");
            executor.shutdown();
            process::exit(0);
        }
        Err(error) => {
            error!("Failed to spawn input loop: {}", error);
            process::exit(1);
        }
    }
}
