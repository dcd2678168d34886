use blockfiles::{BlockFiles, Config, FileStats};

fn usage() -> ! {
    eprintln!("blockfiles create|stat|check directory");
    std::process::exit(1);
}

fn fail(what: &str, path: &str, err: blockfiles::Error) -> ! {
    eprintln!("blockfiles: failed to {what} {path}: {err}");
    std::process::exit(1);
}

fn print_stats(stats: &FileStats) {
    let file_type = stats
        .file_type
        .map_or_else(|| "unknown".to_owned(), |t| format!("{t:?}"));
    println!(
        "data_{}: {} blocks {}/{} used, free runs {:?}, next {}",
        stats.file_number,
        file_type,
        stats.num_entries,
        stats.max_entries,
        stats.empty,
        stats.next_file,
    );
}

fn main() {
    env_logger::init();

    let mut command = None;
    let mut path = None;
    let args = std::env::args().skip(1);
    for arg in args {
        if command.is_none() {
            command = Some(arg);
        } else if path.is_none() {
            path = Some(arg);
        } else {
            eprintln!("blockfiles: too many arguments");
            usage();
        }
    }

    let Some(command) = command else {
        eprintln!("blockfiles: no command specified");
        usage();
    };
    let Some(path) = path else {
        eprintln!("blockfiles: no directory specified");
        usage();
    };

    let create = match command.as_str() {
        "create" => true,
        "stat" | "check" => false,
        _ => {
            eprintln!("blockfiles: unknown command {command}");
            usage();
        }
    };

    let mut files = match BlockFiles::new(&path, Config::default()) {
        Ok(files) => files,
        Err(e) => fail("configure", &path, e),
    };
    if let Err(e) = files.init(create) {
        fail("open block files in", &path, e);
    }

    let stats = match files.stats() {
        Ok(stats) => stats,
        Err(e) => fail("read", &path, e),
    };

    match command.as_str() {
        "create" => {
            eprintln!("blockfiles: created {} block files in {path}", stats.len());
        }
        "stat" => stats.iter().for_each(print_stats),
        _ => {
            let mut fixed = 0;
            for before in &stats {
                if let Err(e) = files.fix_block_file_header(before.file_number) {
                    fail("repair", &path, e);
                }
                let after = match files.stats() {
                    Ok(stats) => stats
                        .into_iter()
                        .find(|s| s.file_number == before.file_number),
                    Err(e) => fail("read", &path, e),
                };
                if after.as_ref() != Some(before) {
                    println!("data_{}: rebuilt allocation counters", before.file_number);
                    fixed += 1;
                }
            }
            println!("{} files checked, {fixed} repaired", stats.len());
        }
    }

    if let Err(e) = files.close() {
        fail("close", &path, e);
    }
}
