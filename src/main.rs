fn main() {
    if handle_cli_flags() {
        return;
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Err(err) = snoolink::run(args) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

fn handle_cli_flags() -> bool {
    let mut saw_flag = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("snoolink {}", snoolink::VERSION);
                saw_flag = true;
            }
            "--help" | "-h" => {
                println!("{}", snoolink::app::USAGE);
                saw_flag = true;
            }
            _ => {}
        }
    }
    saw_flag
}
