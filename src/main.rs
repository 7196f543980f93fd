fn main() {
    if let Err(err) = flatfile_bridge::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
