fn main() {
    module_migrate::cli::run();
}
