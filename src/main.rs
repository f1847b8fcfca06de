use segmenter_lib::{cli::parse_args, commands::run_segmenter_once};

fn main() {
    std::process::exit(run_segmenter_once(parse_args()));
}
