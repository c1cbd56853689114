use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    splat::cli::main()
}
