fn main() -> std::process::ExitCode {
    lymely_lib::run()
}
