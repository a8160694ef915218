use bitflags::bitflags;

bitflags! {
    /// The two directions a fd can be armed for, matching epoll's
    /// `EPOLLIN`/`EPOLLOUT`.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Direction: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.contains(Direction::READ | Direction::WRITE) {
            write!(f, "READ|WRITE")
        } else if self.contains(Direction::READ) {
            write!(f, "READ")
        } else if self.contains(Direction::WRITE) {
            write!(f, "WRITE")
        } else {
            write!(f, "NONE")
        }
    }
}
