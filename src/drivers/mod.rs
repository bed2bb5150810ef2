pub mod tty;

pub fn init() {
    tty::init();
}
